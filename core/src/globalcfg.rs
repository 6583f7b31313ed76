//! Global configuration handler: the `0xA5A5 | cmd | sub | data | 0x5A5A`
//! length-delimited management protocol used to read/write device settings,
//! query monitoring counters, and drive firmware updates (Admin/Save&Reboot
//! only signals the reboot here; the firmware transfer itself is a separate
//! TCP endpoint, see `firmware.rs`).

use crate::channel::{
    DataBits, InterfaceType, OperatingMode, Parity, RealComParams, StopBits, TcpClientParams,
    TcpDestination, TcpServerParams, UartState, UdpDestination, UdpParams, NUM_PORTS,
};
use crate::store::ConfigStore;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::time::{Duration, Instant};

pub const TCP_SETTING_PORT: u16 = 4000;
pub const MAX_COMMAND_LEN: usize = 1024;
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

const HEADER: [u8; 2] = [0xA5, 0xA5];
const TRAILER: [u8; 2] = [0x5A, 0x5A];
const MIN_FRAME_SIZE: usize = 6; // header(2) + cmd(1) + sub(1) + trailer(2)

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Cmd {
    Overview = 0x01,
    Basic = 0x02,
    Network = 0x03,
    Serial = 0x04,
    Operating = 0x05,
    Monitor = 0x06,
    Admin = 0x07,
}

impl Cmd {
    fn from_byte(b: u8) -> Option<Self> {
        use Cmd::*;
        Some(match b {
            0x01 => Overview,
            0x02 => Basic,
            0x03 => Network,
            0x04 => Serial,
            0x05 => Operating,
            0x06 => Monitor,
            0x07 => Admin,
            _ => return None,
        })
    }
}

/// Accumulates bytes from a session's socket and extracts complete frames.
///
/// Per §4.9: scan for the header, dropping bytes in front of it; once a
/// header is found, wait for a trailer starting no earlier than
/// `MIN_FRAME_SIZE - 2` bytes in.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_COMMAND_LEN {
            log::warn!("global config session buffer overflow, clearing");
            self.buf.clear();
        }
    }

    /// Returns `(cmd, sub, data)` for the next complete frame, if any, and
    /// consumes the bytes it used (including any garbage skipped before it).
    pub fn extract(&mut self) -> Option<(u8, u8, Vec<u8>)> {
        let header_pos = self
            .buf
            .windows(2)
            .position(|w| w == HEADER)?;
        if header_pos > 0 {
            self.buf.drain(..header_pos);
        }
        if self.buf.len() < MIN_FRAME_SIZE {
            return None;
        }
        let search_from = MIN_FRAME_SIZE - 2;
        let trailer_rel = self.buf[search_from..]
            .windows(2)
            .position(|w| w == TRAILER)?;
        let trailer_pos = search_from + trailer_rel;

        let cmd = self.buf[2];
        let sub = self.buf[3];
        let data = self.buf[4..trailer_pos].to_vec();
        self.buf.drain(..trailer_pos + 2);
        Some((cmd, sub, data))
    }
}

pub fn frame_reply(cmd: u8, sub: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + payload.len());
    out.extend_from_slice(&HEADER);
    out.push(cmd);
    out.push(sub);
    out.extend_from_slice(payload);
    out.extend_from_slice(&TRAILER);
    out
}

pub struct Outcome {
    pub reply: Vec<u8>,
    pub reboot_requested: bool,
}

fn simple(cmd: u8, sub: u8, payload: Vec<u8>) -> Outcome {
    Outcome {
        reply: frame_reply(cmd, sub, &payload),
        reboot_requested: false,
    }
}

fn encode_serial_entry(index1: usize, c: &crate::channel::Channel) -> Vec<u8> {
    let mut out = Vec::with_capacity(31);
    out.push(index1 as u8);
    let alias_bytes = c.alias.as_bytes();
    let n = alias_bytes.len().min(19);
    out.push(n as u8);
    out.extend_from_slice(&alias_bytes[..n]);
    out.resize(out.len() + (19 - n), 0);
    out.write_u32::<BigEndian>(c.serial.baud).unwrap();
    out.push(c.serial.data_bits.bits());
    out.push(match c.serial.stop_bits {
        StopBits::One => 1,
        StopBits::Two => 2,
    });
    out.push(match c.serial.parity {
        Parity::None => 0,
        Parity::Odd => 1,
        Parity::Even => 2,
        Parity::Mark => 3,
        Parity::Space => 4,
    });
    out.push(c.serial.fifo_enable as u8);
    out.push(c.serial.flow_ctrl as u8);
    out.push(match c.serial.interface_type {
        InterfaceType::Rs232 => 0,
        InterfaceType::Rs422 => 1,
        InterfaceType::Rs485 => 2,
    });
    out
}

/// Dispatches one fully-extracted frame's `cmd`/`sub`/`data` against the
/// shared configuration store and returns the reply frame to send back.
pub fn handle_command(cmd_byte: u8, sub: u8, data: &[u8], store: &ConfigStore) -> Outcome {
    let Some(cmd) = Cmd::from_byte(cmd_byte) else {
        return simple(cmd_byte, sub, vec![0x00]);
    };

    match cmd {
        Cmd::Overview => {
            let cfg = match store.lock() {
                Ok(c) => c,
                Err(_) => return simple(cmd_byte, sub, vec![0x00]),
            };
            let mut payload = Vec::new();
            let mut model = cfg.device.model_name.as_bytes().to_vec();
            model.resize(32, 0);
            payload.extend_from_slice(&model);
            payload.extend_from_slice(&cfg.device.mac.0);
            payload.write_u16::<BigEndian>(cfg.device.serial_no).unwrap();
            payload.extend_from_slice(&[
                cfg.device.firmware_version.major,
                cfg.device.firmware_version.minor,
                cfg.device.firmware_version.patch,
            ]);
            payload.extend_from_slice(&[
                cfg.device.hardware_version.major,
                cfg.device.hardware_version.minor,
                cfg.device.hardware_version.patch,
            ]);
            payload.push(cfg.device.lcm_protected as u8);
            simple(cmd_byte, sub, payload)
        }
        Cmd::Basic => match sub {
            0x00 => {
                let cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                let mut payload = Vec::new();
                let mut name = cfg.device.server_name.as_bytes().to_vec();
                name.resize(32, 0);
                payload.extend_from_slice(&name);
                payload.push(cfg.device.time_zone as u8);
                let mut ts = cfg.device.time_server.as_bytes().to_vec();
                ts.resize(32, 0);
                payload.extend_from_slice(&ts);
                let flags = (cfg.device.web_enabled as u8)
                    | ((cfg.device.telnet_enabled as u8) << 1)
                    | ((cfg.device.lcm_protected as u8) << 2)
                    | ((cfg.device.reset_protected as u8) << 3);
                payload.push(flags);
                simple(cmd_byte, sub, payload)
            }
            0x01 => {
                if data.len() < 66 {
                    return simple(cmd_byte, sub, vec![0x00]);
                }
                let mut cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                cfg.device.server_name = trim_cstr(&data[0..32]);
                cfg.device.time_zone = data[32] as i8;
                cfg.device.time_server = trim_cstr(&data[33..65]);
                let flags = data[65];
                cfg.device.web_enabled = flags & 0x01 != 0;
                cfg.device.telnet_enabled = flags & 0x02 != 0;
                cfg.device.lcm_protected = flags & 0x04 != 0;
                cfg.device.reset_protected = flags & 0x08 != 0;
                drop(cfg);
                let _ = store.save();
                simple(cmd_byte, sub, vec![0x01])
            }
            _ => simple(cmd_byte, sub, vec![0x00]),
        },
        Cmd::Network => match sub {
            0x00 => {
                let cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                let iface = &cfg.device.interfaces[0];
                let ar = &cfg.device.auto_report;
                let mut payload = Vec::new();
                payload.write_u32::<BigEndian>(iface.ip).unwrap();
                payload.write_u32::<BigEndian>(iface.mask).unwrap();
                payload.write_u32::<BigEndian>(iface.gateway).unwrap();
                payload.push(iface.dhcp as u8);
                payload.write_u32::<BigEndian>(cfg.device.dns1).unwrap();
                payload.write_u32::<BigEndian>(cfg.device.dns2).unwrap();
                payload.push(cfg.device.snmp_enabled as u8);
                payload.write_u32::<BigEndian>(ar.ip).unwrap();
                payload.write_u16::<BigEndian>(ar.udp_port).unwrap();
                payload.write_u16::<BigEndian>(ar.period_secs).unwrap();
                simple(cmd_byte, sub, payload)
            }
            0x01 => {
                let mut cursor = Cursor::new(data);
                let parsed = (|| -> std::io::Result<_> {
                    let ip = cursor.read_u32::<BigEndian>()?;
                    let mask = cursor.read_u32::<BigEndian>()?;
                    let gw = cursor.read_u32::<BigEndian>()?;
                    let dhcp = cursor.read_u8()? != 0;
                    let dns1 = cursor.read_u32::<BigEndian>()?;
                    let dns2 = cursor.read_u32::<BigEndian>()?;
                    let snmp = cursor.read_u8()? != 0;
                    let ar_ip = cursor.read_u32::<BigEndian>()?;
                    let ar_port = cursor.read_u16::<BigEndian>()?;
                    let ar_period = cursor.read_u16::<BigEndian>()?;
                    Ok((ip, mask, gw, dhcp, dns1, dns2, snmp, ar_ip, ar_port, ar_period))
                })();
                let Ok((ip, mask, gw, dhcp, dns1, dns2, snmp, ar_ip, ar_port, ar_period)) = parsed else {
                    return simple(cmd_byte, sub, vec![0x00]);
                };
                let mut cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                cfg.device.interfaces[0].ip = ip;
                cfg.device.interfaces[0].mask = mask;
                cfg.device.interfaces[0].gateway = gw;
                cfg.device.interfaces[0].dhcp = dhcp;
                cfg.device.dns1 = dns1;
                cfg.device.dns2 = dns2;
                cfg.device.snmp_enabled = snmp;
                cfg.device.auto_report.ip = ar_ip;
                cfg.device.auto_report.udp_port = ar_port;
                cfg.device.auto_report.period_secs = ar_period;
                drop(cfg);
                let _ = store.save();
                simple(cmd_byte, sub, vec![0x01])
            }
            _ => simple(cmd_byte, sub, vec![0x00]),
        },
        Cmd::Serial => match sub {
            0x00 => {
                let cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                let mut payload = Vec::new();
                for (i, c) in cfg.channels.iter().enumerate() {
                    payload.extend_from_slice(&encode_serial_entry(i + 1, c));
                }
                simple(cmd_byte, sub, payload)
            }
            0x01 => {
                let Some(&index1) = data.first() else {
                    return simple(cmd_byte, sub, vec![0x00]);
                };
                let cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                match cfg.channel((index1 as usize).wrapping_sub(1)) {
                    Ok(c) => simple(cmd_byte, sub, encode_serial_entry(index1 as usize, c)),
                    Err(_) => simple(cmd_byte, sub, vec![0x00]),
                }
            }
            0x02 => {
                if data.is_empty() {
                    return simple(cmd_byte, sub, vec![0x00]);
                }
                let index1 = data[0] as usize;
                if index1 == 0 || index1 > NUM_PORTS || data.len() < 31 {
                    return simple(cmd_byte, sub, vec![0x00]);
                }
                let mut cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                let ch = cfg.channel_mut(index1 - 1).unwrap();
                let alias_len = (data[1] as usize).min(19);
                if let Some(alias_bytes) = data.get(2..2 + alias_len) {
                    ch.alias = trim_cstr(alias_bytes);
                }
                let mut cursor = Cursor::new(&data[21..]);
                ch.serial.baud = cursor.read_u32::<BigEndian>().unwrap_or(ch.serial.baud);
                ch.serial.data_bits = match data.get(25).copied().unwrap_or(8) {
                    5 => DataBits::Five,
                    6 => DataBits::Six,
                    7 => DataBits::Seven,
                    _ => DataBits::Eight,
                };
                ch.serial.stop_bits = if data.get(26).copied().unwrap_or(1) == 2 {
                    StopBits::Two
                } else {
                    StopBits::One
                };
                ch.serial.parity = match data.get(27).copied().unwrap_or(0) {
                    1 => Parity::Odd,
                    2 => Parity::Even,
                    3 => Parity::Mark,
                    4 => Parity::Space,
                    _ => Parity::None,
                };
                ch.serial.fifo_enable = data.get(28).copied().unwrap_or(1) != 0;
                ch.serial.flow_ctrl = data.get(29).copied().unwrap_or(0) != 0;
                ch.serial.interface_type = match data.get(30).copied().unwrap_or(0) {
                    1 => InterfaceType::Rs422,
                    2 => InterfaceType::Rs485,
                    _ => InterfaceType::Rs232,
                };
                drop(cfg);
                let _ = store.save();
                simple(cmd_byte, sub, vec![0x01])
            }
            _ => simple(cmd_byte, sub, vec![0x00]),
        },
        Cmd::Operating => match sub {
            0x00 | 0x01 => {
                let Some(&index1) = data.first() else {
                    return simple(cmd_byte, sub, vec![0x00]);
                };
                let cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                match cfg.channel((index1 as usize).wrapping_sub(1)) {
                    Ok(c) => {
                        let mut payload = vec![index1, mode_tag(&c.op_mode)];
                        payload.resize(64, 0);
                        simple(cmd_byte, sub, payload)
                    }
                    Err(_) => simple(cmd_byte, sub, vec![0x00]),
                }
            }
            0x02 => {
                if data.len() < 2 {
                    return simple(cmd_byte, sub, vec![0x00]);
                }
                let index1 = data[0] as usize;
                let mode_tag = data[1];
                if index1 == 0 || index1 > NUM_PORTS {
                    return simple(cmd_byte, sub, vec![0x00]);
                }
                let mut cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                let ch = cfg.channel_mut(index1 - 1).unwrap();
                let previous = ch.op_mode;
                let applied = match mode_tag {
                    0 => Some(OperatingMode::Disabled),
                    1 => parse_realcom_params(data).map(OperatingMode::RealCom),
                    2 => Some(OperatingMode::TcpServer(TcpServerParams {
                        keepalive_min: 7,
                        max_connections: 4,
                        local_tcp_port: 4001 + index1 as u16 - 1,
                        command_port: 966 + index1 as u16 - 1,
                        inactivity_time_ms: 0,
                    })),
                    3 => parse_tcp_client_params(data).map(OperatingMode::TcpClient),
                    4 => parse_udp_params(data).map(OperatingMode::Udp),
                    _ => None,
                };
                match applied {
                    Some(mode) => {
                        ch.op_mode = mode;
                        drop(cfg);
                        let _ = store.save();
                        simple(cmd_byte, sub, vec![0x01])
                    }
                    None => {
                        ch.op_mode = previous;
                        simple(cmd_byte, sub, vec![0x00])
                    }
                }
            }
            _ => simple(cmd_byte, sub, vec![0x00]),
        },
        Cmd::Monitor => match sub {
            0x01 => {
                let Some(&index1) = data.first() else {
                    return simple(cmd_byte, sub, vec![0x00]);
                };
                let cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                match cfg.channel((index1 as usize).wrapping_sub(1)) {
                    Ok(c) => {
                        let payload = vec![
                            index1,
                            mode_tag(&c.op_mode),
                            uart_state_tag(c.uart_state),
                            c.data_clients.num_clients() as u8,
                            c.cmd_clients.num_clients() as u8,
                        ];
                        simple(cmd_byte, sub, payload)
                    }
                    Err(_) => simple(cmd_byte, sub, vec![0x00]),
                }
            }
            0x02 => {
                let Some(&index1) = data.first() else {
                    return simple(cmd_byte, sub, vec![0x00]);
                };
                let cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                match cfg.channel((index1 as usize).wrapping_sub(1)) {
                    Ok(c) => {
                        let mut payload = Vec::new();
                        payload.write_u64::<BigEndian>(c.counters.rx_count).unwrap();
                        payload.write_u64::<BigEndian>(c.counters.tx_count).unwrap();
                        let flags = (c.modem.dsr as u8) | ((c.modem.cts as u8) << 1) | ((c.modem.dcd as u8) << 2);
                        payload.push(flags);
                        simple(cmd_byte, sub, payload)
                    }
                    Err(_) => simple(cmd_byte, sub, vec![0x00]),
                }
            }
            0x03 => {
                let Some(&index1) = data.first() else {
                    return simple(cmd_byte, sub, vec![0x00]);
                };
                let cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                match cfg.channel((index1 as usize).wrapping_sub(1)) {
                    Ok(c) => simple(cmd_byte, sub, encode_serial_entry(index1 as usize, c)),
                    Err(_) => simple(cmd_byte, sub, vec![0x00]),
                }
            }
            _ => simple(cmd_byte, sub, vec![0x00]),
        },
        Cmd::Admin => match sub {
            0x00 => {
                let Some((user, rest)) = read_pascal(data, 0) else {
                    return simple(cmd_byte, sub, vec![0x00]);
                };
                let Some((pass, _)) = read_pascal(data, rest) else {
                    return simple(cmd_byte, sub, vec![0x00]);
                };
                let cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                let ok = cfg.device.username == user && cfg.device.password == pass;
                simple(cmd_byte, sub, vec![ok as u8])
            }
            0x01 => {
                let Some((old, p1)) = read_pascal(data, 0) else {
                    return simple(cmd_byte, sub, vec![0x00]);
                };
                let Some((new, p2)) = read_pascal(data, p1) else {
                    return simple(cmd_byte, sub, vec![0x00]);
                };
                let Some((confirm, _)) = read_pascal(data, p2) else {
                    return simple(cmd_byte, sub, vec![0x00]);
                };
                let mut cfg = match store.lock() {
                    Ok(c) => c,
                    Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                };
                if cfg.device.password != old || new != confirm {
                    return simple(cmd_byte, sub, vec![0x00]);
                }
                cfg.device.password = new;
                drop(cfg);
                let _ = store.save();
                simple(cmd_byte, sub, vec![0x01])
            }
            0x02 => {
                {
                    let mut cfg = match store.lock() {
                        Ok(c) => c,
                        Err(_) => return simple(cmd_byte, sub, vec![0x00]),
                    };
                    *cfg = crate::store::SystemConfiguration::load_defaults();
                }
                let _ = store.save();
                simple(cmd_byte, sub, vec![0x01])
            }
            0x03 => {
                let _ = store.save();
                Outcome {
                    reply: frame_reply(cmd_byte, sub, &[0x01]),
                    reboot_requested: true,
                }
            }
            _ => simple(cmd_byte, sub, vec![0x00]),
        },
    }
}

/// Operating-mode write payload, after `index1`/`mode_tag`, for RealCOM:
/// `keepalive_min(u16) max_connections(u8) allow_driver_control(u8)`.
fn parse_realcom_params(data: &[u8]) -> Option<RealComParams> {
    let mut cursor = Cursor::new(data.get(2..)?);
    Some(RealComParams {
        keepalive_min: cursor.read_u16::<BigEndian>().ok()?,
        max_connections: cursor.read_u8().ok()?,
        allow_driver_control: cursor.read_u8().ok()? != 0,
    })
}

/// TCP Client write payload: `keepalive_min(u16) inactivity_time_ms(u32)`
/// followed by 4 destinations of `dest_ip(u32) dest_port(u16)
/// designated_local_port(u16)`, then `connection_control(u8)`.
fn parse_tcp_client_params(data: &[u8]) -> Option<TcpClientParams> {
    let mut cursor = Cursor::new(data.get(2..)?);
    let keepalive_min = cursor.read_u16::<BigEndian>().ok()?;
    let inactivity_time_ms = cursor.read_u32::<BigEndian>().ok()?;
    let mut destinations = [TcpDestination::default(); 4];
    for dest in destinations.iter_mut() {
        dest.dest_ip = cursor.read_u32::<BigEndian>().ok()?;
        dest.dest_port = cursor.read_u16::<BigEndian>().ok()?;
        dest.designated_local_port = cursor.read_u16::<BigEndian>().ok()?;
    }
    let connection_control = cursor.read_u8().ok()? != 0;
    Some(TcpClientParams {
        keepalive_min,
        inactivity_time_ms,
        destinations,
        connection_control,
    })
}

/// UDP write payload: 4 destinations of `begin_ip(u32) end_ip(u32) port(u16)`
/// followed by `local_udp_listen_port(u16)`.
fn parse_udp_params(data: &[u8]) -> Option<UdpParams> {
    let mut cursor = Cursor::new(data.get(2..)?);
    let mut destinations = [UdpDestination::default(); 4];
    for dest in destinations.iter_mut() {
        dest.begin_ip = cursor.read_u32::<BigEndian>().ok()?;
        dest.end_ip = cursor.read_u32::<BigEndian>().ok()?;
        dest.port = cursor.read_u16::<BigEndian>().ok()?;
    }
    let local_udp_listen_port = cursor.read_u16::<BigEndian>().ok()?;
    Some(UdpParams {
        destinations,
        local_udp_listen_port,
    })
}

fn uart_state_tag(state: UartState) -> u8 {
    match state {
        UartState::Closed => 0,
        UartState::Opened => 1,
        UartState::Error => 2,
    }
}

fn mode_tag(mode: &OperatingMode) -> u8 {
    match mode {
        OperatingMode::Disabled => 0,
        OperatingMode::RealCom(_) => 1,
        OperatingMode::TcpServer(_) => 2,
        OperatingMode::TcpClient(_) => 3,
        OperatingMode::Udp(_) => 4,
    }
}

fn trim_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

fn read_pascal(data: &[u8], offset: usize) -> Option<(String, usize)> {
    let len = *data.get(offset)? as usize;
    let start = offset + 1;
    let end = start + len;
    let slice = data.get(start..end)?;
    Some((String::from_utf8_lossy(slice).to_string(), end))
}

/// Per-session idle tracking: a session with no bytes for
/// [`INACTIVITY_TIMEOUT`] is closed, per §5.
pub struct IdleTimer {
    last_activity: Instant,
}

impl Default for IdleTimer {
    fn default() -> Self {
        IdleTimer {
            last_activity: Instant::now(),
        }
    }
}

impl IdleTimer {
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn expired(&self) -> bool {
        self.last_activity.elapsed() >= INACTIVITY_TIMEOUT
    }
}

/// Drives one accepted management-protocol connection to completion:
/// extracts frames, dispatches each through [`handle_command`], and closes
/// the session on an idle timeout, a client disconnect, or a completed
/// Save & Reboot.
pub fn handle_session(stream: &mut std::net::TcpStream, store: &ConfigStore) -> std::io::Result<()> {
    use std::io::{Read, Write};

    stream.set_read_timeout(Some(Duration::from_millis(500)))?;
    let mut fb = FrameBuffer::default();
    let mut idle = IdleTimer::default();
    let mut buf = [0u8; 256];

    loop {
        if idle.expired() {
            log::info!("global config session idle, closing");
            return Ok(());
        }
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                idle.touch();
                fb.push(&buf[..n]);
                while let Some((cmd, sub, data)) = fb.extract() {
                    let outcome = handle_command(cmd, sub, &data, store);
                    stream.write_all(&outcome.reply)?;
                    if outcome.reboot_requested {
                        log::warn!("save & reboot requested, closing management session");
                        return Ok(());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;

    #[test]
    fn frame_buffer_extracts_single_frame() {
        let mut fb = FrameBuffer::default();
        fb.push(&[0xA5, 0xA5, 0x01, 0x00, 0x5A, 0x5A]);
        let (cmd, sub, data) = fb.extract().unwrap();
        assert_eq!(cmd, 0x01);
        assert_eq!(sub, 0x00);
        assert!(data.is_empty());
    }

    #[test]
    fn frame_buffer_skips_garbage_before_header() {
        let mut fb = FrameBuffer::default();
        fb.push(&[0xFF, 0xFF, 0xA5, 0xA5, 0x01, 0x00, 0x5A, 0x5A]);
        assert!(fb.extract().is_some());
    }

    #[test]
    fn frame_buffer_waits_for_more_bytes() {
        let mut fb = FrameBuffer::default();
        fb.push(&[0xA5, 0xA5, 0x03, 0x01, 0x00, 0x00]);
        assert!(fb.extract().is_none());
    }

    #[test]
    fn network_write_then_read_roundtrips() {
        let store = ConfigStore::init(Box::new(MemFlash::new(0x20_0000))).unwrap();
        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(0x0A000001).unwrap();
        payload.write_u32::<BigEndian>(0xFFFFFF00u32).unwrap();
        payload.write_u32::<BigEndian>(0x0A0000FE).unwrap();
        payload.push(0);
        payload.write_u32::<BigEndian>(0x08080808u32).unwrap();
        payload.write_u32::<BigEndian>(0x08080404u32).unwrap();
        payload.push(1);
        payload.write_u32::<BigEndian>(0).unwrap();
        payload.write_u16::<BigEndian>(0).unwrap();
        payload.write_u16::<BigEndian>(0).unwrap();

        let write_out = handle_command(0x03, 0x01, &payload, &store);
        assert_eq!(&write_out.reply[4..write_out.reply.len() - 2], &[0x01]);

        let read_out = handle_command(0x03, 0x00, &[], &store);
        let read_payload = &read_out.reply[4..read_out.reply.len() - 2];
        assert_eq!(read_payload, payload.as_slice());
    }

    #[test]
    fn admin_login_rejects_wrong_password() {
        let store = ConfigStore::init(Box::new(MemFlash::new(0x20_0000))).unwrap();
        let mut data = vec![5];
        data.extend_from_slice(b"admin");
        data.push(5);
        data.extend_from_slice(b"wrong");
        let out = handle_command(0x07, 0x00, &data, &store);
        assert_eq!(&out.reply[4..out.reply.len() - 2], &[0x00]);
    }

    #[test]
    fn admin_load_factory_defaults_is_idempotent() {
        let store = ConfigStore::init(Box::new(MemFlash::new(0x20_0000))).unwrap();
        handle_command(0x07, 0x02, &[], &store);
        let snapshot1 = store.with_flash(|f| f.read(crate::env::ENV_OFFSET_B, crate::env::ENV_SECT_SIZE).unwrap());
        handle_command(0x07, 0x02, &[], &store);
        let snapshot2 = store.with_flash(|f| f.read(crate::env::ENV_OFFSET_A, crate::env::ENV_SECT_SIZE).unwrap());
        assert!(!snapshot1.iter().all(|&b| b == 0xFF));
        assert!(!snapshot2.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn serial_write_then_read_roundtrips_every_field() {
        let store = ConfigStore::init(Box::new(MemFlash::new(0x20_0000))).unwrap();
        let mut payload = vec![1u8, 5];
        let mut alias = b"gizmo".to_vec();
        alias.resize(19, 0);
        payload.extend_from_slice(&alias);
        payload.write_u32::<BigEndian>(57600).unwrap();
        payload.push(7); // data bits
        payload.push(2); // stop bits: two
        payload.push(2); // parity: even
        payload.push(0); // fifo disabled
        payload.push(1); // flow enabled
        payload.push(1); // interface: rs422

        let write_out = handle_command(0x04, 0x02, &payload, &store);
        assert_eq!(&write_out.reply[4..write_out.reply.len() - 2], &[0x01]);

        let read_out = handle_command(0x04, 0x01, &[1], &store);
        let read_payload = &read_out.reply[4..read_out.reply.len() - 2];
        assert_eq!(read_payload, payload.as_slice());
    }

    #[test]
    fn monitor_line_reports_mode_tag_and_uart_state() {
        let store = ConfigStore::init(Box::new(MemFlash::new(0x20_0000))).unwrap();
        let out = handle_command(0x06, 0x01, &[1], &store);
        let payload = &out.reply[4..out.reply.len() - 2];
        assert_eq!(payload, &[1, 2, 0, 0, 0]); // index1, TcpServer tag, closed, no clients
    }

    #[test]
    fn operating_write_reaches_realcom_tcp_client_and_udp_modes() {
        let store = ConfigStore::init(Box::new(MemFlash::new(0x20_0000))).unwrap();

        let mut realcom = vec![1u8, 1];
        realcom.write_u16::<BigEndian>(7).unwrap();
        realcom.push(4);
        realcom.push(1);
        let out = handle_command(0x05, 0x02, &realcom, &store);
        assert_eq!(&out.reply[4..out.reply.len() - 2], &[0x01]);
        {
            let cfg = store.lock().unwrap();
            match cfg.channels[0].op_mode {
                OperatingMode::RealCom(p) => {
                    assert_eq!(p.keepalive_min, 7);
                    assert_eq!(p.max_connections, 4);
                    assert!(p.allow_driver_control);
                }
                _ => panic!("expected RealCom mode"),
            }
        }

        let mut udp = vec![2u8, 4];
        for _ in 0..4 {
            udp.write_u32::<BigEndian>(0).unwrap();
            udp.write_u32::<BigEndian>(0).unwrap();
            udp.write_u16::<BigEndian>(0).unwrap();
        }
        udp.write_u16::<BigEndian>(4002).unwrap();
        let out = handle_command(0x05, 0x02, &udp, &store);
        assert_eq!(&out.reply[4..out.reply.len() - 2], &[0x01]);
        {
            let cfg = store.lock().unwrap();
            match cfg.channels[1].op_mode {
                OperatingMode::Udp(p) => assert_eq!(p.local_udp_listen_port, 4002),
                _ => panic!("expected Udp mode"),
            }
        }

        let mut tcp_client = vec![3u8, 3];
        tcp_client.write_u16::<BigEndian>(0).unwrap();
        tcp_client.write_u32::<BigEndian>(0).unwrap();
        for _ in 0..4 {
            tcp_client.write_u32::<BigEndian>(0x0A000001).unwrap();
            tcp_client.write_u16::<BigEndian>(4001).unwrap();
            tcp_client.write_u16::<BigEndian>(0).unwrap();
        }
        tcp_client.push(1);
        let out = handle_command(0x05, 0x02, &tcp_client, &store);
        assert_eq!(&out.reply[4..out.reply.len() - 2], &[0x01]);
        let cfg = store.lock().unwrap();
        match cfg.channels[2].op_mode {
            OperatingMode::TcpClient(p) => {
                assert_eq!(p.destinations[0].dest_ip, 0x0A000001);
                assert!(p.connection_control);
            }
            _ => panic!("expected TcpClient mode"),
        }
    }
}
