//! Byte-addressed flash HAL.
//!
//! The real device backs this with raw NOR flash; [`MemFlash`] backs it with
//! an in-memory (optionally file-persisted) byte vector so the connection
//! and config-store logic can be exercised without hardware, the way
//! `UartHal`'s [`crate::uart::SimUart`] stands in for a register bank.

use crate::error::FlashError;
use std::fs;
use std::path::{Path, PathBuf};

/// Minimal byte-addressed flash operations.
pub trait FlashHal: Send {
    fn read(&self, offset: u32, len: usize) -> Result<Vec<u8>, FlashError>;
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;
    fn erase(&mut self, offset: u32, len: usize) -> Result<(), FlashError>;
    fn size(&self) -> u32;
}

/// An in-memory flash image, optionally backed by a file on disk so state
/// survives process restarts during local testing.
pub struct MemFlash {
    data: Vec<u8>,
    backing_file: Option<PathBuf>,
}

impl MemFlash {
    pub fn new(size: u32) -> Self {
        MemFlash {
            data: vec![0xFFu8; size as usize],
            backing_file: None,
        }
    }

    /// Loads (or creates) a flash image backed by `path`, persisted on every write/erase.
    pub fn open_file<P: AsRef<Path>>(path: P, size: u32) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read(&path) {
            Ok(bytes) if bytes.len() == size as usize => bytes,
            _ => vec![0xFFu8; size as usize],
        };
        Ok(MemFlash {
            data,
            backing_file: Some(path),
        })
    }

    fn persist(&self) -> Result<(), FlashError> {
        if let Some(path) = &self.backing_file {
            fs::write(path, &self.data).map_err(|e| FlashError::Device(e.to_string()))?;
        }
        Ok(())
    }
}

impl FlashHal for MemFlash {
    fn read(&self, offset: u32, len: usize) -> Result<Vec<u8>, FlashError> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or(FlashError::ReadOutOfRange { offset, len })?;
        Ok(self.data[start..end].to_vec())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&e| e <= self.data.len())
            .ok_or(FlashError::WriteOutOfRange {
                offset,
                len: data.len(),
            })?;
        self.data[start..end].copy_from_slice(data);
        self.persist()
    }

    fn erase(&mut self, offset: u32, len: usize) -> Result<(), FlashError> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or(FlashError::EraseOutOfRange { offset, len })?;
        for b in &mut self.data[start..end] {
            *b = 0xFF;
        }
        self.persist()
    }

    fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let mut f = MemFlash::new(1024);
        f.write(100, b"hello").unwrap();
        assert_eq!(f.read(100, 5).unwrap(), b"hello");
    }

    #[test]
    fn erase_resets_to_0xff() {
        let mut f = MemFlash::new(16);
        f.write(0, b"abcd").unwrap();
        f.erase(0, 4).unwrap();
        assert_eq!(f.read(0, 4).unwrap(), vec![0xFF; 4]);
    }

    #[test]
    fn out_of_range_read_errors() {
        let f = MemFlash::new(16);
        assert!(f.read(10, 100).is_err());
    }

    #[test]
    fn file_backed_flash_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.img");
        {
            let mut f = MemFlash::open_file(&path, 256).unwrap();
            f.write(0, b"persisted").unwrap();
        }
        let f2 = MemFlash::open_file(&path, 256).unwrap();
        assert_eq!(&f2.read(0, 9).unwrap(), b"persisted");
    }
}
