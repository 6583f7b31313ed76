//! Engine for a 16-port serial-to-network terminal server: per-channel UART
//! state and operating modes, a flash-backed device configuration store, a
//! connection manager, a combined realtime/network scheduler, the RealCOM
//! command protocol, a firmware update server, UDP discovery, and the
//! `0xA5A5`-framed global configuration protocol — wired together by
//! [`Runtime`].
//!
//! ```no_run
//! use nport_core::config::default_config;
//! use nport_core::flash::MemFlash;
//! use nport_core::store::ConfigStore;
//! use nport_core::uart::SimUart;
//! use nport_core::Runtime;
//!
//! let cfg = default_config();
//! let store = ConfigStore::init(Box::new(MemFlash::new(0x200_0000))).unwrap();
//! let runtime = Runtime::new(cfg, store);
//! runtime.run(Box::new(SimUart::new(16))).unwrap();
//! ```

pub mod channel;
pub mod config;
pub mod conn_manager;
pub mod crc;
pub mod device;
pub mod discovery;
pub mod env;
pub mod error;
pub mod firmware;
pub mod flash;
pub mod globalcfg;
pub mod realcom;
pub mod ring;
mod runtime;
pub mod scheduler;
pub mod store;
pub mod uart;

pub use self::error::NportError;
pub use self::runtime::Runtime;

