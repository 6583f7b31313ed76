//! UDP discovery responder, grounded on the original device's
//! `UdpSearchTask`: a broadcast-capable socket on port 48899 that replies
//! to a fixed probe string with a `;`-joined device summary line.

use crate::store::ConfigStore;
use std::io;
use std::net::UdpSocket;

pub const SEARCH_PORT: u16 = 48899;
pub const SEARCH_PROBE: &[u8] = b"SEARCH_DEVICE_WQ";

/// Builds the reply line for one discovery probe:
/// `<model>;<MAC>;<serial>;<firmware>;<hardware>;<ip>`, matching the
/// original's `"%s;%02X:...;%hu;%d.%d.%d;%d.%d.%d;%s"` format string.
pub fn build_reply(store: &ConfigStore) -> Result<String, crate::error::ConfigError> {
    let cfg = store.lock()?;
    let ip = std::net::Ipv4Addr::from(cfg.device.interfaces[0].ip);
    Ok(format!(
        "{};{};{};{};{};{}",
        cfg.device.model_name,
        cfg.device.mac,
        cfg.device.serial_no,
        cfg.device.firmware_version,
        cfg.device.hardware_version,
        ip,
    ))
}

/// Runs the discovery responder loop forever on a blocking socket; intended
/// to be the body of its own dedicated thread (see `runtime.rs`).
pub fn run(store: &ConfigStore) -> io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", SEARCH_PORT))?;
    socket.set_broadcast(true)?;
    let mut buf = [0u8; 256];

    loop {
        let (n, peer) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("discovery: recv failed: {}", e);
                continue;
            }
        };
        if &buf[..n.min(SEARCH_PROBE.len())] != SEARCH_PROBE {
            continue;
        }
        match build_reply(store) {
            Ok(reply) => {
                if let Err(e) = socket.send_to(reply.as_bytes(), peer) {
                    log::warn!("discovery: reply to {} failed: {}", peer, e);
                }
            }
            Err(e) => log::warn!("discovery: config read failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;

    #[test]
    fn reply_contains_expected_fields() {
        let store = ConfigStore::init(Box::new(MemFlash::new(0x20_0000))).unwrap();
        let reply = build_reply(&store).unwrap();
        let fields: Vec<&str> = reply.split(';').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[0], "NPort-5650-16");
    }
}
