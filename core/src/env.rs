//! Redundant two-sector environment block, modeled on U-Boot's
//! `fw_setenv`/`fw_saveenv` scheme: two alternating 64 KiB sectors, each
//! `crc32(data) | generation_flag | "name=value\0"... | \0`, so a power
//! loss mid-commit always leaves the other sector valid.

use crate::crc::crc32;
use crate::error::EnvError;
use crate::flash::FlashHal;

pub const ENV_OFFSET_A: u32 = 0x120000;
pub const ENV_OFFSET_B: u32 = 0x130000;
pub const ENV_SECT_SIZE: usize = 0x10000;
const HEADER_LEN: usize = 5; // 4-byte CRC32 + 1-byte generation flag
const DATA_CAPACITY: usize = ENV_SECT_SIZE - HEADER_LEN;

/// In-memory view of the environment's key/value data, loaded from whichever
/// sector (A or B) holds the higher generation flag among the valid ones.
pub struct Environment {
    data: Vec<u8>,
    flag: u8,
}

impl Environment {
    fn validate(raw: &[u8]) -> Option<(u32, u8, &[u8])> {
        if raw.len() != ENV_SECT_SIZE {
            return None;
        }
        let stored_crc = u32::from_be_bytes(raw[0..4].try_into().unwrap());
        let flag = raw[4];
        let data = &raw[HEADER_LEN..];
        if crc32(0, data) == stored_crc {
            Some((stored_crc, flag, data))
        } else {
            None
        }
    }

    /// Reads both redundant sectors and keeps the valid one with the higher
    /// generation flag (0xFF wraps to 1); an all-invalid pair yields an empty
    /// environment with flag 1, matching `app_fw_find_env`'s fallback.
    pub fn find(flash: &dyn FlashHal) -> Result<Self, EnvError> {
        let raw_a = flash.read(ENV_OFFSET_A, ENV_SECT_SIZE)?;
        let raw_b = flash.read(ENV_OFFSET_B, ENV_SECT_SIZE)?;
        let a = Self::validate(&raw_a);
        let b = Self::validate(&raw_b);

        let chosen = match (a, b) {
            (Some((_, fa, da)), Some((_, fb, db))) => {
                if fa >= fb {
                    (fa, da)
                } else {
                    (fb, db)
                }
            }
            (Some((_, fa, da)), None) => (fa, da),
            (None, Some((_, fb, db))) => (fb, db),
            (None, None) => {
                return Ok(Environment {
                    data: empty_data(),
                    flag: 1,
                })
            }
        };

        Ok(Environment {
            data: chosen.1.to_vec(),
            flag: chosen.0,
        })
    }

    /// Sets (or, with an empty `value`, removes) a `name=value` entry.
    pub fn setenv(&mut self, name: &str, value: &str) -> Result<(), EnvError> {
        let mut rebuilt = Vec::with_capacity(self.data.len());
        let mut found = false;
        for entry in split_entries(&self.data) {
            let entry_str = std::str::from_utf8(entry).unwrap_or("");
            if let Some((entry_name, _)) = entry_str.split_once('=') {
                if entry_name == name {
                    found = true;
                    if !value.is_empty() {
                        append_entry(&mut rebuilt, name, value)?;
                    }
                    continue;
                }
            }
            rebuilt.extend_from_slice(entry);
            rebuilt.push(0);
        }
        if !found && !value.is_empty() {
            append_entry(&mut rebuilt, name, value)?;
        }
        rebuilt.push(0);
        rebuilt.resize(DATA_CAPACITY, 0);
        self.data = rebuilt;
        Ok(())
    }

    pub fn getenv(&self, name: &str) -> Option<String> {
        for entry in split_entries(&self.data) {
            let entry_str = std::str::from_utf8(entry).ok()?;
            if let Some((entry_name, value)) = entry_str.split_once('=') {
                if entry_name == name {
                    return Some(value.to_string());
                }
            }
        }
        None
    }

    /// Writes the current in-memory environment to the inactive sector,
    /// incrementing the generation flag (0xFF wraps to 1) so the new sector
    /// sorts after the old one on the next `find`.
    pub fn save(&mut self, flash: &mut dyn FlashHal) -> Result<(), EnvError> {
        let new_flag = if self.flag == 0xFF { 1 } else { self.flag + 1 };
        // The inactive sector is A when the current (active) generation is odd,
        // B otherwise — the save always targets the sector that is NOT holding
        // the generation we just loaded.
        let target_offset = if self.flag % 2 == 1 {
            ENV_OFFSET_A
        } else {
            ENV_OFFSET_B
        };

        let mut sector = Vec::with_capacity(ENV_SECT_SIZE);
        let crc = crc32(0, &self.data);
        sector.extend_from_slice(&crc.to_be_bytes());
        sector.push(new_flag);
        sector.extend_from_slice(&self.data);

        flash.erase(target_offset, ENV_SECT_SIZE)?;
        flash.write(target_offset, &sector)?;
        self.flag = new_flag;
        Ok(())
    }
}

fn empty_data() -> Vec<u8> {
    vec![0u8; DATA_CAPACITY]
}

fn split_entries(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|&b| b == 0).take_while(|s| !s.is_empty())
}

fn append_entry(out: &mut Vec<u8>, name: &str, value: &str) -> Result<(), EnvError> {
    let needed = out.len() + name.len() + 1 + value.len() + 1;
    if needed > DATA_CAPACITY {
        return Err(EnvError::NoSpace);
    }
    out.extend_from_slice(name.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;

    #[test]
    fn find_on_blank_flash_yields_empty_env() {
        let flash = MemFlash::new(ENV_OFFSET_B as u32 + ENV_SECT_SIZE as u32);
        let env = Environment::find(&flash).unwrap();
        assert_eq!(env.flag, 1);
        assert_eq!(env.getenv("anything"), None);
    }

    #[test]
    fn setenv_then_save_then_find_roundtrips() {
        let mut flash = MemFlash::new(ENV_OFFSET_B as u32 + ENV_SECT_SIZE as u32);
        let mut env = Environment::find(&flash).unwrap();
        env.setenv("ver_select", "b").unwrap();
        env.save(&mut flash).unwrap();

        let env2 = Environment::find(&flash).unwrap();
        assert_eq!(env2.getenv("ver_select"), Some("b".to_string()));
    }

    #[test]
    fn second_save_alternates_sector_and_bumps_flag() {
        let mut flash = MemFlash::new(ENV_OFFSET_B as u32 + ENV_SECT_SIZE as u32);
        let mut env = Environment::find(&flash).unwrap();
        env.setenv("a", "1").unwrap();
        env.save(&mut flash).unwrap();
        let flag_after_first = env.flag;

        env.setenv("a", "2").unwrap();
        env.save(&mut flash).unwrap();
        assert_eq!(env.flag, flag_after_first + 1);

        let env2 = Environment::find(&flash).unwrap();
        assert_eq!(env2.getenv("a"), Some("2".to_string()));
    }

    #[test]
    fn setenv_with_empty_value_removes_entry() {
        let mut flash = MemFlash::new(ENV_OFFSET_B as u32 + ENV_SECT_SIZE as u32);
        let mut env = Environment::find(&flash).unwrap();
        env.setenv("a", "1").unwrap();
        env.setenv("a", "").unwrap();
        assert_eq!(env.getenv("a"), None);
        env.save(&mut flash).unwrap();
        let env2 = Environment::find(&flash).unwrap();
        assert_eq!(env2.getenv("a"), None);
    }

    #[test]
    fn corrupt_sector_is_ignored_in_favor_of_valid_one() {
        let mut flash = MemFlash::new(ENV_OFFSET_B as u32 + ENV_SECT_SIZE as u32);
        let mut env = Environment::find(&flash).unwrap();
        env.setenv("k", "v").unwrap();
        env.save(&mut flash).unwrap();

        // Corrupt sector B (never written in this single save) — should be ignored.
        flash.write(ENV_OFFSET_B, &[0xAAu8; 16]).unwrap();
        let env2 = Environment::find(&flash).unwrap();
        assert_eq!(env2.getenv("k"), Some("v".to_string()));
    }
}
