//! Firmware update server: validates a streamed package against five CRC
//! and magic checks, then commits it to the inactive (B) flash slot and
//! flips the boot-selection environment variables.

use crate::crc::crc32;
use crate::env::Environment;
use crate::error::FirmwareError;
use crate::store::ConfigStore;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const UPDATE_PORT: u16 = 19001;
pub const MAX_PACKAGE_SIZE: u32 = 20 * 1024 * 1024;
const HEADER_LEN: usize = 128;
const FW_PACKAGE_MAGIC: u32 = 0x5550_4454;

pub const STATUS_OK_TO_PROCEED: u32 = 1;
pub const STATUS_WRITE_COMPLETE: u32 = 2;
pub const STATUS_ERROR: u32 = 0xFFFF_FFFF;

const FW_BIT_OFFSET_B: u32 = 0x00B4_0000;
const FW_APP_OFFSET_B: u32 = 0x0104_0000;
const FW_SLOT_SIZE: usize = 5 * 1024 * 1024;

struct PackageHeader {
    bit_length: u32,
    bit_crc32: u32,
    app_length: u32,
    app_crc32: u32,
}

/// Runs the five ordered checks from §4.11 against a fully-received package
/// and returns its parsed header on success.
fn validate_package(data: &[u8]) -> Result<PackageHeader, FirmwareError> {
    if data.len() < HEADER_LEN {
        return Err(FirmwareError::BadLength);
    }
    let mut header = &data[..HEADER_LEN];

    let magic = header.read_u32::<LittleEndian>().map_err(FirmwareError::Io)?;
    if magic != FW_PACKAGE_MAGIC {
        return Err(FirmwareError::BadMagic);
    }
    let header_crc = header.read_u32::<LittleEndian>().map_err(FirmwareError::Io)?;
    if crc32(0, &data[8..HEADER_LEN]) != header_crc {
        return Err(FirmwareError::BadHeaderCrc);
    }

    // pkg_version[32] + bit_version[32] + app_version[32]
    let mut rest = &data[8 + 4 + 96..HEADER_LEN];
    let _timestamp = rest.read_u32::<LittleEndian>().map_err(FirmwareError::Io)?;
    let bit_length = rest.read_u32::<LittleEndian>().map_err(FirmwareError::Io)?;
    let bit_crc32 = rest.read_u32::<LittleEndian>().map_err(FirmwareError::Io)?;
    let app_length = rest.read_u32::<LittleEndian>().map_err(FirmwareError::Io)?;
    let app_crc32 = rest.read_u32::<LittleEndian>().map_err(FirmwareError::Io)?;

    let expected_total = HEADER_LEN as u64 + bit_length as u64 + app_length as u64;
    if expected_total != data.len() as u64 {
        return Err(FirmwareError::BadLength);
    }

    let bit_start = HEADER_LEN;
    let bit_end = bit_start + bit_length as usize;
    if crc32(0, &data[bit_start..bit_end]) != bit_crc32 {
        return Err(FirmwareError::BadBitCrc);
    }
    let app_start = bit_end;
    let app_end = app_start + app_length as usize;
    if crc32(0, &data[app_start..app_end]) != app_crc32 {
        return Err(FirmwareError::BadAppCrc);
    }

    Ok(PackageHeader {
        bit_length,
        bit_crc32,
        app_length,
        app_crc32,
    })
}

/// Commits a validated package to the B slots and flips boot selection.
/// The environment save is the last operation, so a crash mid-write never
/// leaves the boot selector pointing at a half-written slot.
fn commit_update(store: &ConfigStore, data: &[u8], header: &PackageHeader) -> Result<(), FirmwareError> {
    let bitstream = &data[HEADER_LEN..HEADER_LEN + header.bit_length as usize];
    let application = &data
        [HEADER_LEN + header.bit_length as usize..HEADER_LEN + header.bit_length as usize + header.app_length as usize];

    if bitstream.len() > FW_SLOT_SIZE || application.len() > FW_SLOT_SIZE {
        return Err(FirmwareError::TooLarge(data.len() as u32));
    }

    store.with_flash(|flash| -> Result<(), FirmwareError> {
        flash.erase(FW_BIT_OFFSET_B, FW_SLOT_SIZE)?;
        flash.write(FW_BIT_OFFSET_B, bitstream)?;
        flash.erase(FW_APP_OFFSET_B, FW_SLOT_SIZE)?;
        flash.write(FW_APP_OFFSET_B, application)?;

        let mut env = Environment::find(flash)?;
        env.setenv("fpga_size_b", &header.bit_length.to_string())?;
        env.setenv("app_size_b", &header.app_length.to_string())?;
        env.setenv("boot_count", "3")?;
        env.setenv("ver_select", "b")?;
        env.save(flash)?;
        Ok(())
    })
}

fn send_status<W: Write>(stream: &mut W, status: u32) -> std::io::Result<()> {
    stream.write_u32::<BigEndian>(status)
}

/// Handles one firmware-update TCP session end to end: reads the
/// length-prefixed package, validates it, and on success commits it and
/// replies with the two success statuses in order.
pub fn handle_connection<S: Read + Write>(stream: &mut S, store: &ConfigStore) -> Result<(), FirmwareError> {
    let file_size = stream.read_u32::<BigEndian>().map_err(FirmwareError::Io)?;
    if file_size == 0 {
        send_status(stream, STATUS_ERROR).ok();
        return Err(FirmwareError::Empty);
    }
    if file_size > MAX_PACKAGE_SIZE {
        send_status(stream, STATUS_ERROR).ok();
        return Err(FirmwareError::TooLarge(file_size));
    }

    let mut data = vec![0u8; file_size as usize];
    if let Err(e) = stream.read_exact(&mut data) {
        send_status(stream, STATUS_ERROR).ok();
        return Err(FirmwareError::Io(e));
    }

    let header = match validate_package(&data) {
        Ok(h) => h,
        Err(e) => {
            send_status(stream, STATUS_ERROR).ok();
            return Err(e);
        }
    };

    send_status(stream, STATUS_OK_TO_PROCEED).map_err(FirmwareError::Io)?;

    if let Err(e) = commit_update(store, &data, &header) {
        send_status(stream, STATUS_ERROR).ok();
        return Err(e);
    }

    send_status(stream, STATUS_WRITE_COMPLETE).map_err(FirmwareError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;
    use std::io::Cursor;

    fn build_package(bitstream: &[u8], application: &[u8]) -> Vec<u8> {
        let mut header = vec![0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&FW_PACKAGE_MAGIC.to_le_bytes());
        // header_crc32 filled in below once the rest of the header is set.
        let timestamp_off = 8 + 4 + 96;
        header[timestamp_off..timestamp_off + 4].copy_from_slice(&0u32.to_le_bytes());
        header[timestamp_off + 4..timestamp_off + 8].copy_from_slice(&(bitstream.len() as u32).to_le_bytes());
        header[timestamp_off + 8..timestamp_off + 12].copy_from_slice(&crc32(0, bitstream).to_le_bytes());
        header[timestamp_off + 12..timestamp_off + 16].copy_from_slice(&(application.len() as u32).to_le_bytes());
        header[timestamp_off + 16..timestamp_off + 20].copy_from_slice(&crc32(0, application).to_le_bytes());

        let header_crc = crc32(0, &header[8..HEADER_LEN]);
        header[4..8].copy_from_slice(&header_crc.to_le_bytes());

        let mut package = header;
        package.extend_from_slice(bitstream);
        package.extend_from_slice(application);
        package
    }

    fn new_store() -> ConfigStore {
        ConfigStore::init(Box::new(MemFlash::new(0x200_0000))).unwrap()
    }

    #[test]
    fn happy_path_sends_ok_then_complete() {
        let store = new_store();
        let package = build_package(b"BITSTREAM-DATA", b"APPLICATION-DATA");
        let mut wire = Vec::new();
        wire.write_u32::<BigEndian>(package.len() as u32).unwrap();
        wire.extend_from_slice(&package);

        let mut stream = Cursor::new(wire);
        let mut reply = Vec::new();
        let mut combined = ReadWriteCursor {
            read: &mut stream,
            write: &mut reply,
        };
        handle_connection(&mut combined, &store).unwrap();

        let mut r = Cursor::new(reply);
        assert_eq!(r.read_u32::<BigEndian>().unwrap(), STATUS_OK_TO_PROCEED);
        assert_eq!(r.read_u32::<BigEndian>().unwrap(), STATUS_WRITE_COMPLETE);
    }

    #[test]
    fn bad_magic_is_rejected_before_any_flash_write() {
        let store = new_store();
        let mut package = build_package(b"B", b"A");
        package[0] = 0x00; // corrupt magic
        let mut wire = Vec::new();
        wire.write_u32::<BigEndian>(package.len() as u32).unwrap();
        wire.extend_from_slice(&package);

        let mut stream = Cursor::new(wire);
        let mut reply = Vec::new();
        let mut combined = ReadWriteCursor {
            read: &mut stream,
            write: &mut reply,
        };
        assert!(handle_connection(&mut combined, &store).is_err());
        let mut r = Cursor::new(reply);
        assert_eq!(r.read_u32::<BigEndian>().unwrap(), STATUS_ERROR);
    }

    /// Minimal `Read + Write` adapter so tests can drive `handle_connection`
    /// from two separate in-memory buffers instead of a real socket pair.
    struct ReadWriteCursor<'a> {
        read: &'a mut Cursor<Vec<u8>>,
        write: &'a mut Vec<u8>,
    }

    impl<'a> Read for ReadWriteCursor<'a> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.read.read(buf)
        }
    }

    impl<'a> Write for ReadWriteCursor<'a> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.write.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
