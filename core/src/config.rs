//! Runtime configuration options.
//!
//! This is distinct from [`crate::store::SystemConfiguration`]: the runtime
//! config governs the *process* (where the flash image lives, how often the
//! scheduler ticks, how verbosely it logs) and is loaded once at startup from
//! a TOML file. Device settings (network, serial, operating mode per
//! channel) live in the flash-backed environment and are never read from
//! this file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig, crate::error::ConfigError> {
    let config_str = fs::read_to_string(path).map_err(crate::error::ConfigError::Io)?;
    toml::from_str(&config_str).map_err(crate::error::ConfigError::Parse)
}

/// Returns the built-in default configuration.
///
/// For demonstration purposes. Assumes the binary is run from a writable
/// working directory:
/// ```toml
/// flash_dir = "./flash"
/// tick_period_us = 1000
///
/// [logging]
///     default_level = "info"
/// ```
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Top-level runtime configuration.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding the two simulated flash-environment sector files
    /// (`env_a.bin`, `env_b.bin`) plus the B-slot firmware images, when
    /// running without real onboard flash. Defaults to `"./flash"`.
    #[serde(default = "default_flash_dir")]
    pub flash_dir: String,

    /// Period between scheduler minor cycles, in microseconds. The original
    /// hardware drives this from a 10 kHz timer interrupt (100 us); this
    /// target runs it as a free-running loop instead, so the default is
    /// relaxed to keep CPU usage reasonable on commodity hardware. Defaults
    /// to `1000` (1 kHz).
    #[serde(default = "default_tick_period_us")]
    pub tick_period_us: u64,

    /// Logging options.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Global configuration (management protocol) session settings.
    #[serde(default)]
    pub globalcfg: GlobalCfgConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            flash_dir: default_flash_dir(),
            tick_period_us: default_tick_period_us(),
            logging: LoggingConfig::default(),
            globalcfg: GlobalCfgConfig::default(),
        }
    }
}

fn default_flash_dir() -> String {
    "./flash".to_string()
}

fn default_tick_period_us() -> u64 {
    1000
}

/* --------------------------------------------------------------------------------- */

/// Logging options, consumed by the `nport-serverd` binary to initialize
/// `env_logger`. `RUST_LOG`, when set, always takes precedence over
/// `default_level`.
///
/// ## Example
/// ```toml
/// [logging]
///     default_level = "debug"
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingConfig {
    /// Log level used when `RUST_LOG` is not set in the environment.
    /// Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub default_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            default_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/* --------------------------------------------------------------------------------- */

/// Global configuration (management protocol) session options.
///
/// ## Example
/// ```toml
/// [globalcfg]
///     port = 4000
///     inactivity_timeout_secs = 30
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GlobalCfgConfig {
    /// TCP port the management protocol listens on. Defaults to `4000`.
    #[serde(default = "default_globalcfg_port")]
    pub port: u16,

    /// Idle session timeout, in seconds. Defaults to `30`.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
}

impl Default for GlobalCfgConfig {
    fn default() -> Self {
        GlobalCfgConfig {
            port: default_globalcfg_port(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
        }
    }
}

fn default_globalcfg_port() -> u16 {
    crate::globalcfg::TCP_SETTING_PORT
}

fn default_inactivity_timeout_secs() -> u64 {
    crate::globalcfg::INACTIVITY_TIMEOUT.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = default_config();
        let serialized = toml::to_string(&cfg).unwrap();
        let parsed: RuntimeConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.flash_dir, cfg.flash_dir);
        assert_eq!(parsed.tick_period_us, cfg.tick_period_us);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let parsed: RuntimeConfig = toml::from_str("flash_dir = \"/tmp/nport-flash\"\n").unwrap();
        assert_eq!(parsed.flash_dir, "/tmp/nport-flash");
        assert_eq!(parsed.tick_period_us, default_tick_period_us());
        assert_eq!(parsed.logging.default_level, "info");
    }

    #[test]
    fn missing_file_is_an_error_not_a_panic() {
        assert!(load_config("/nonexistent/path/nport.toml").is_err());
    }
}
