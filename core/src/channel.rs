//! Per-channel state: UART parameters, operating mode, client slots, ring
//! buffers, and the counters the LED monostable and stats logger read.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ring::{RingBuffer, RING_BUFFER_SIZE};

pub const NUM_PORTS: usize = 16;
pub const MAX_CLIENTS_PER_CHANNEL: usize = 4;
pub const MIN_PACKET_SIZE: usize = 4;
pub const MAX_PACKET_SIZE: usize = 256;
const BITS_PER_CHAR: u32 = 10;

/// Sentinel stored in unused client slots, matching the source's `-1` fd convention.
pub const NO_CLIENT: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartState {
    Closed,
    Opened,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetSubState {
    Idle,
    Listening,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl DataBits {
    pub fn bits(self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceType {
    Rs232,
    Rs422,
    Rs485,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelimiterProcess {
    None,
    AppendDelim1,
    AppendDelim2,
    Strip,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SerialParams {
    pub baud: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_ctrl: bool,
    pub fifo_enable: bool,
    pub interface_type: InterfaceType,
    pub dtr: bool,
    pub rts: bool,
    pub rts_cts: bool,
    pub xon_xoff: bool,
    pub break_active: bool,
}

impl Default for SerialParams {
    fn default() -> Self {
        SerialParams {
            baud: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_ctrl: false,
            fifo_enable: true,
            interface_type: InterfaceType::Rs232,
            dtr: false,
            rts: false,
            rts_cts: false,
            xon_xoff: false,
            break_active: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PackingSettings {
    pub packing_length: u16,
    pub force_transmit_time_ms: u16,
    pub delimiter1: u8,
    pub delimiter2: u8,
    pub delimiter_process: DelimiterProcess,
}

impl Default for PackingSettings {
    fn default() -> Self {
        PackingSettings {
            packing_length: 0,
            force_transmit_time_ms: 0,
            delimiter1: 0,
            delimiter2: 0,
            delimiter_process: DelimiterProcess::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TcpDestination {
    pub dest_ip: u32,
    pub dest_port: u16,
    pub designated_local_port: u16,
}

impl Default for TcpDestination {
    fn default() -> Self {
        TcpDestination {
            dest_ip: 0,
            dest_port: 0,
            designated_local_port: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UdpDestination {
    pub begin_ip: u32,
    pub end_ip: u32,
    pub port: u16,
}

impl Default for UdpDestination {
    fn default() -> Self {
        UdpDestination {
            begin_ip: 0,
            end_ip: 0,
            port: 4001,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RealComParams {
    pub keepalive_min: u16,
    pub max_connections: u8,
    pub allow_driver_control: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TcpServerParams {
    pub keepalive_min: u16,
    pub max_connections: u8,
    pub local_tcp_port: u16,
    pub command_port: u16,
    pub inactivity_time_ms: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TcpClientParams {
    pub keepalive_min: u16,
    pub inactivity_time_ms: u32,
    pub destinations: [TcpDestination; 4],
    pub connection_control: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UdpParams {
    pub destinations: [UdpDestination; 4],
    pub local_udp_listen_port: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum OperatingMode {
    Disabled,
    RealCom(RealComParams),
    TcpServer(TcpServerParams),
    TcpClient(TcpClientParams),
    Udp(UdpParams),
}

impl OperatingMode {
    pub fn max_connections(&self) -> u8 {
        match self {
            OperatingMode::RealCom(p) => p.max_connections,
            OperatingMode::TcpServer(p) => p.max_connections,
            _ => MAX_CLIENTS_PER_CHANNEL as u8,
        }
    }
}

/// Fixed-front client slot list: the first `num_clients` entries are
/// non-negative fds (conceptually — this crate stores `mio::Token` values as
/// `i32`); the rest hold [`NO_CLIENT`]. Removal is swap-with-last.
#[derive(Debug, Clone, Copy)]
pub struct ClientSlots {
    slots: [i32; MAX_CLIENTS_PER_CHANNEL],
    num_clients: usize,
}

impl Default for ClientSlots {
    fn default() -> Self {
        ClientSlots {
            slots: [NO_CLIENT; MAX_CLIENTS_PER_CHANNEL],
            num_clients: 0,
        }
    }
}

impl ClientSlots {
    pub fn num_clients(&self) -> usize {
        self.num_clients
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.slots[..self.num_clients].iter().copied()
    }

    pub fn push(&mut self, id: i32) -> bool {
        if self.num_clients >= MAX_CLIENTS_PER_CHANNEL {
            return false;
        }
        self.slots[self.num_clients] = id;
        self.num_clients += 1;
        true
    }

    /// Removes `id` via swap-with-last; returns true if it was present.
    pub fn remove(&mut self, id: i32) -> bool {
        if let Some(pos) = self.slots[..self.num_clients].iter().position(|&s| s == id) {
            let last = self.num_clients - 1;
            self.slots[pos] = self.slots[last];
            self.slots[last] = NO_CLIENT;
            self.num_clients -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ModemStatus {
    pub dsr: bool,
    pub cts: bool,
    pub dcd: bool,
}

/// Count-down "monostable" LED state: set on activity, decays to off.
#[derive(Debug, Default, Clone, Copy)]
pub struct LedTimer {
    ticks_remaining: u32,
}

impl LedTimer {
    pub const ON_DURATION_TICKS: u32 = 3;

    pub fn is_lit(&self) -> bool {
        self.ticks_remaining > 0
    }

    pub fn on_activity(&mut self) {
        self.ticks_remaining = Self::ON_DURATION_TICKS;
    }

    pub fn decay(&mut self) {
        if self.ticks_remaining > 0 {
            self.ticks_remaining -= 1;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub rx_count: u64,
    pub tx_count: u64,
    pub rx_net: u64,
    pub tx_net: u64,
    pub rx_dropped: u64,
    rx_count_prev: u64,
    tx_count_prev: u64,
}

impl Counters {
    /// Advances the LED "last counter" snapshots, returning whether each
    /// direction saw activity since the previous call.
    pub fn sample_activity(&mut self) -> (bool, bool) {
        let rx_active = self.rx_count != self.rx_count_prev;
        let tx_active = self.tx_count != self.tx_count_prev;
        self.rx_count_prev = self.rx_count;
        self.tx_count_prev = self.tx_count;
        (rx_active, tx_active)
    }
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx={} tx={} rx_net={} tx_net={}",
            self.rx_count, self.tx_count, self.rx_net, self.tx_net
        )
    }
}

/// The subset of a [`Channel`]'s state that survives a reboot — everything
/// else (client slots, ring buffers, counters, LED state) is runtime-only
/// and reinitializes from [`Channel::new`]. Field order matters for
/// `toml`'s serializer (scalars before nested tables): `op_mode` can
/// serialize as either depending on its variant, so it's placed before the
/// unconditionally-nested `serial`/`packing` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub alias: String,
    pub send_interval_ms: u32,
    pub op_mode: OperatingMode,
    pub serial: SerialParams,
    pub packing: PackingSettings,
}

pub struct Channel {
    pub channel_index: usize,
    pub uart_state: UartState,
    pub data_substate: NetSubState,
    pub cmd_substate: NetSubState,
    pub data_clients: ClientSlots,
    pub cmd_clients: ClientSlots,
    pub alias: String,
    pub serial: SerialParams,
    pub op_mode: OperatingMode,
    pub packing: PackingSettings,
    pub buffer_uart: RingBuffer,
    pub buffer_net: RingBuffer,
    pub counters: Counters,
    pub modem: ModemStatus,
    pub led_rx: LedTimer,
    pub led_tx: LedTimer,
    pub send_interval_ms: u32,
    pub packet_size: usize,
}

impl Channel {
    pub fn new(channel_index: usize) -> Self {
        Channel {
            channel_index,
            uart_state: UartState::Closed,
            data_substate: NetSubState::Idle,
            cmd_substate: NetSubState::Idle,
            data_clients: ClientSlots::default(),
            cmd_clients: ClientSlots::default(),
            alias: format!("Port {}", channel_index + 1),
            serial: SerialParams::default(),
            op_mode: OperatingMode::TcpServer(TcpServerParams {
                keepalive_min: 7,
                max_connections: 4,
                local_tcp_port: (4001 + channel_index) as u16,
                command_port: (966 + channel_index) as u16,
                inactivity_time_ms: 0,
            }),
            packing: PackingSettings::default(),
            buffer_uart: RingBuffer::new(RING_BUFFER_SIZE),
            buffer_net: RingBuffer::new(RING_BUFFER_SIZE),
            counters: Counters::default(),
            modem: ModemStatus::default(),
            led_rx: LedTimer::default(),
            led_tx: LedTimer::default(),
            send_interval_ms: 1,
            packet_size: MIN_PACKET_SIZE,
        }
    }

    /// Total client count across data and command planes.
    pub fn total_clients(&self) -> usize {
        self.data_clients.num_clients() + self.cmd_clients.num_clients()
    }

    /// Snapshots the persisted fields for writing to flash.
    pub fn config_snapshot(&self) -> ChannelConfig {
        ChannelConfig {
            alias: self.alias.clone(),
            send_interval_ms: self.send_interval_ms,
            op_mode: self.op_mode,
            serial: self.serial,
            packing: self.packing,
        }
    }

    /// Restores the persisted fields loaded from flash, re-deriving
    /// `packet_size` from the restored baud rather than persisting it
    /// separately.
    pub fn apply_config(&mut self, config: ChannelConfig) {
        self.alias = config.alias;
        self.serial = config.serial;
        self.op_mode = config.op_mode;
        self.packing = config.packing;
        self.recompute_packet_size(config.send_interval_ms.max(1));
    }

    /// Recomputes `packet_size` and `send_interval_ms` from the current baud,
    /// per §3: `packet_size = clamp((baud * interval_ms * 40) / (10 * BITS_PER_CHAR * 1000))`.
    pub fn recompute_packet_size(&mut self, interval_ms: u32) {
        self.send_interval_ms = interval_ms;
        let raw = (self.serial.baud as u64 * interval_ms as u64 * 40)
            / (10 * BITS_PER_CHAR as u64 * 1000);
        self.packet_size = (raw as usize).clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE);
    }

    /// Transitions the channel back to its quiescent closed state: clears
    /// both ring buffers and marks the UART closed, per the invariant that
    /// `uart_state == CLOSED` implies empty buffers.
    pub fn close_uart(&mut self) {
        self.uart_state = UartState::Closed;
        self.buffer_uart.init();
        self.buffer_net.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_slots_push_and_swap_remove() {
        let mut s = ClientSlots::default();
        assert!(s.push(10));
        assert!(s.push(20));
        assert!(s.push(30));
        assert!(s.remove(20));
        assert_eq!(s.num_clients(), 2);
        let remaining: Vec<_> = s.iter().collect();
        assert!(remaining.contains(&10));
        assert!(remaining.contains(&30));
    }

    #[test]
    fn client_slots_reject_beyond_capacity() {
        let mut s = ClientSlots::default();
        for i in 0..MAX_CLIENTS_PER_CHANNEL {
            assert!(s.push(i as i32));
        }
        assert!(!s.push(99));
    }

    #[test]
    fn packet_size_clamped_for_high_baud() {
        let mut c = Channel::new(0);
        c.serial.baud = 921600;
        c.recompute_packet_size(1);
        assert_eq!(c.packet_size, MAX_PACKET_SIZE);
    }

    #[test]
    fn packet_size_floors_at_minimum_for_low_baud() {
        let mut c = Channel::new(0);
        c.serial.baud = 300;
        c.recompute_packet_size(1);
        assert_eq!(c.packet_size, MIN_PACKET_SIZE);
    }

    #[test]
    fn close_uart_empties_buffers() {
        let mut c = Channel::new(0);
        c.buffer_uart.enqueue(b"data");
        c.close_uart();
        assert!(c.buffer_uart.is_empty());
        assert!(c.buffer_net.is_empty());
        assert_eq!(c.uart_state, UartState::Closed);
    }
}
