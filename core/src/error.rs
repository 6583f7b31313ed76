//! Crate-wide error types.
//!
//! Each module that can fail defines its own narrow error enum; this module
//! aggregates them into [`NportError`] for callers (task loops, the binary)
//! that only need to log and move on, not match on specifics.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HalError {
    #[error("uart configure failed on channel {0}")]
    ConfigureFailed(u8),
    #[error("uart operation timed out on channel {0}")]
    Timeout(u8),
}

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("flash read out of range: offset {offset} len {len}")]
    ReadOutOfRange { offset: u32, len: usize },
    #[error("flash write out of range: offset {offset} len {len}")]
    WriteOutOfRange { offset: u32, len: usize },
    #[error("flash erase out of range: offset {offset} len {len}")]
    EraseOutOfRange { offset: u32, len: usize },
    #[error("underlying device error: {0}")]
    Device(String),
}

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("no valid environment sector found")]
    NoValidSector,
    #[error("environment data exceeds sector capacity")]
    NoSpace,
    #[error(transparent)]
    Flash(#[from] FlashError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid channel index {0}")]
    InvalidChannel(usize),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("config mutex poisoned")]
    Poisoned,
    #[error("failed to read runtime config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize device configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("package too large: {0} bytes")]
    TooLarge(u32),
    #[error("package empty")]
    Empty,
    #[error("truncated transfer: expected {expected} got {got}")]
    Truncated { expected: u32, got: usize },
    #[error("bad magic number")]
    BadMagic,
    #[error("header crc mismatch")]
    BadHeaderCrc,
    #[error("length fields don't sum to package size")]
    BadLength,
    #[error("bitstream crc mismatch")]
    BadBitCrc,
    #[error("application crc mismatch")]
    BadAppCrc,
    #[error(transparent)]
    Flash(#[from] FlashError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NportError {
    #[error(transparent)]
    Hal(#[from] HalError),
    #[error(transparent)]
    Flash(#[from] FlashError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
