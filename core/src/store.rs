//! Device config store: the single `SystemConfiguration` instance and the
//! mutex that guards it.
//!
//! Rust's standard library has no priority-inheriting mutex — PI is a
//! kernel-scheduler property, not something a portable userspace API can
//! promise — so this uses `std::sync::Mutex` and documents the gap rather
//! than reaching for a platform-specific crate (see DESIGN.md).

use crate::channel::{Channel, ChannelConfig, NUM_PORTS};
use crate::device::DeviceSettings;
use crate::env::Environment;
use crate::error::ConfigError;
use crate::flash::FlashHal;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// The persisted form of a [`SystemConfiguration`]: device identity/network
/// settings plus each channel's persisted fields, serialized as TOML into a
/// single environment entry.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedConfig {
    device: DeviceSettings,
    channels: Vec<ChannelConfig>,
}

pub struct SystemConfiguration {
    pub device: DeviceSettings,
    pub channels: Vec<Channel>,
}

impl SystemConfiguration {
    pub fn load_defaults() -> Self {
        SystemConfiguration {
            device: DeviceSettings::load_defaults(),
            channels: (0..NUM_PORTS).map(Channel::new).collect(),
        }
    }

    pub fn channel(&self, index: usize) -> Result<&Channel, ConfigError> {
        self.channels.get(index).ok_or(ConfigError::InvalidChannel(index))
    }

    pub fn channel_mut(&mut self, index: usize) -> Result<&mut Channel, ConfigError> {
        self.channels
            .get_mut(index)
            .ok_or(ConfigError::InvalidChannel(index))
    }

    /// Per-channel connection caps, cheap to snapshot (each `OperatingMode`
    /// is `Copy`) for callers that poll outside the config lock.
    pub fn max_connections_snapshot(&self) -> Vec<u32> {
        self.channels.iter().map(|c| c.op_mode.max_connections() as u32).collect()
    }
}

/// Owns the single process-wide [`SystemConfiguration`] and the flash
/// environment it is persisted to.
pub struct ConfigStore {
    config: Mutex<SystemConfiguration>,
    flash: Mutex<Box<dyn FlashHal>>,
}

const SYSTEM_CONFIG_ENV_KEY: &str = "system_config_toml";

impl ConfigStore {
    /// Loads from flash; on any failure (corrupt or blank environment),
    /// falls back to factory defaults and immediately persists them.
    pub fn init(flash: Box<dyn FlashHal>) -> Result<Self, ConfigError> {
        let store = ConfigStore {
            config: Mutex::new(SystemConfiguration::load_defaults()),
            flash: Mutex::new(flash),
        };
        match store.load_from_flash() {
            Ok(()) => Ok(store),
            Err(_) => {
                store.load_defaults_into_memory();
                store.save()?;
                Ok(store)
            }
        }
    }

    fn load_defaults_into_memory(&self) {
        let mut guard = self.config.lock().unwrap_or_else(|e| e.into_inner());
        *guard = SystemConfiguration::load_defaults();
    }

    /// Loads the environment block, deserializes the persisted device and
    /// per-channel configuration out of it, and applies it to the in-memory
    /// `SystemConfiguration`. Fails if the environment has no valid sector
    /// or the stored entry doesn't parse, leaving the in-memory config
    /// untouched (the caller falls back to factory defaults).
    pub fn load_from_flash(&self) -> Result<(), ConfigError> {
        let persisted = {
            let flash = self.flash.lock().unwrap_or_else(|e| e.into_inner());
            let env = Environment::find(flash.as_ref())?;
            let raw = env
                .getenv(SYSTEM_CONFIG_ENV_KEY)
                .ok_or(ConfigError::Env(crate::error::EnvError::NoValidSector))?;
            toml::from_str::<PersistedConfig>(&raw)?
        };

        let mut cfg = self.config.lock().unwrap_or_else(|e| e.into_inner());
        cfg.device = persisted.device;
        for (channel, channel_config) in cfg.channels.iter_mut().zip(persisted.channels) {
            channel.apply_config(channel_config);
        }
        Ok(())
    }

    /// Serializes the current device and per-channel configuration to TOML
    /// and commits it to the inactive environment sector.
    pub fn save(&self) -> Result<(), ConfigError> {
        let raw = {
            let cfg = self.config.lock().unwrap_or_else(|e| e.into_inner());
            let persisted = PersistedConfig {
                device: cfg.device.clone(),
                channels: cfg.channels.iter().map(Channel::config_snapshot).collect(),
            };
            toml::to_string(&persisted)?
        };

        let mut flash = self.flash.lock().unwrap_or_else(|e| e.into_inner());
        let mut env = Environment::find(flash.as_ref())?;
        env.setenv(SYSTEM_CONFIG_ENV_KEY, &raw)?;
        env.save(flash.as_mut())?;
        Ok(())
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, SystemConfiguration>, ConfigError> {
        self.config.lock().map_err(|_| ConfigError::Poisoned)
    }

    /// Grants exclusive access to the backing flash device, for callers
    /// (the firmware update server) that need raw erase/write access
    /// outside the key/value environment abstraction.
    pub fn with_flash<R>(&self, f: impl FnOnce(&mut dyn FlashHal) -> R) -> R {
        let mut flash = self.flash.lock().unwrap_or_else(|e| e.into_inner());
        f(flash.as_mut())
    }

    /// Updates interface `ifindex`'s address fields and persists.
    pub fn apply_network(
        &self,
        ifindex: usize,
        ip: u32,
        mask: u32,
        gateway: u32,
    ) -> Result<(), ConfigError> {
        {
            let mut cfg = self.lock()?;
            if let Some(iface) = cfg.device.interfaces.get_mut(ifindex) {
                iface.ip = ip;
                iface.mask = mask;
                iface.gateway = gateway;
            }
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;

    fn new_store() -> ConfigStore {
        ConfigStore::init(Box::new(MemFlash::new(0x200000))).unwrap()
    }

    #[test]
    fn init_on_blank_flash_loads_defaults() {
        let store = new_store();
        let cfg = store.lock().unwrap();
        assert_eq!(cfg.channels.len(), NUM_PORTS);
        assert_eq!(cfg.device.model_name, "NPort-5650-16");
    }

    #[test]
    fn factory_defaults_are_idempotent_on_flash() {
        let store = new_store();
        store.save().unwrap();
        let flash_copy = {
            let flash = store.flash.lock().unwrap();
            flash.read(crate::env::ENV_OFFSET_A, crate::env::ENV_SECT_SIZE).unwrap()
        };
        store.save().unwrap();
        let flash_copy2 = {
            let flash = store.flash.lock().unwrap();
            flash.read(crate::env::ENV_OFFSET_B, crate::env::ENV_SECT_SIZE).unwrap()
        };
        // Both saves wrote valid, independently-readable environments.
        assert!(!flash_copy.iter().all(|&b| b == 0xFF));
        assert!(!flash_copy2.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn apply_network_persists_and_is_visible_under_lock() {
        let store = new_store();
        store.apply_network(0, 0x0A000001, 0xFFFFFF00, 0x0A0000FE).unwrap();
        let cfg = store.lock().unwrap();
        assert_eq!(cfg.device.interfaces[0].ip, 0x0A000001);
    }

    #[test]
    fn device_and_channel_settings_survive_a_simulated_reboot() {
        let dir = tempfile::tempdir().unwrap();
        let flash_path = dir.path().join("flash.bin");

        {
            let flash = crate::flash::MemFlash::open_file(&flash_path, 0x200000).unwrap();
            let store = ConfigStore::init(Box::new(flash)).unwrap();
            {
                let mut cfg = store.lock().unwrap();
                cfg.device.server_name = "renamed-nport".to_string();
                let ch = cfg.channel_mut(2).unwrap();
                ch.alias = "spectrometer".to_string();
                ch.serial.baud = 115200;
            }
            store.save().unwrap();
        }

        let flash = crate::flash::MemFlash::open_file(&flash_path, 0x200000).unwrap();
        let store = ConfigStore::init(Box::new(flash)).unwrap();
        let cfg = store.lock().unwrap();
        assert_eq!(cfg.device.server_name, "renamed-nport");
        assert_eq!(cfg.channels[2].alias, "spectrometer");
        assert_eq!(cfg.channels[2].serial.baud, 115200);
    }
}
