//! RealCOM command handler: parses the `[cmd][len][payload]` ASPP stream
//! carried on a channel's command socket and mutates its live UART state.
//!
//! Grounded byte-for-byte on the original device's `app_cmd.c` command
//! table, which is more precise about reply shapes than prose alone.

use crate::channel::{Channel, DataBits, Parity, StopBits, UartState};
use crate::uart::UartHal;

const BAUD_TABLE: [u32; 19] = [
    300, 600, 1200, 2400, 4800, 7200, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
    150, 134, 110, 75, 50,
];

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdId {
    LineCtrl = 0x12,
    Flush = 0x14,
    SetBaud = 0x17,
    XonXoff = 0x18,
    StartBreak = 0x21,
    StopBreak = 0x22,
    Notify = 0x26,
    Alive = 0x28,
    PortInit = 0x2C,
    WaitOQueue = 0x2F,
    TxFifo = 0x30,
    SetXon = 0x33,
    SetXoff = 0x34,
}

impl CmdId {
    fn from_byte(b: u8) -> Option<Self> {
        use CmdId::*;
        Some(match b {
            0x12 => LineCtrl,
            0x14 => Flush,
            0x17 => SetBaud,
            0x18 => XonXoff,
            0x21 => StartBreak,
            0x22 => StopBreak,
            0x26 => Notify,
            0x28 => Alive,
            0x2C => PortInit,
            0x2F => WaitOQueue,
            0x30 => TxFifo,
            0x33 => SetXon,
            0x34 => SetXoff,
            _ => return None,
        })
    }
}

fn ok_reply(op: u8) -> Vec<u8> {
    vec![op, b'O', b'K']
}

fn parity_from_bits(bits: u8) -> Parity {
    match bits {
        0b000 => Parity::None,
        0b001 => Parity::Even,
        0b010 => Parity::Odd,
        0b011 => Parity::Mark,
        0b100 => Parity::Space,
        _ => Parity::None,
    }
}

fn data_bits_from_bits(bits: u8) -> DataBits {
    match bits & 0x03 {
        0 => DataBits::Five,
        1 => DataBits::Six,
        2 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

/// Handles one complete `[cmd][len][payload]` frame, mutating `channel`'s
/// live UART parameters through `uart` as needed, and returns the bytes (if
/// any) to write back on the command socket.
pub fn handle_frame(channel: &mut Channel, uart: &mut dyn UartHal, frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < 2 {
        return None;
    }
    let op = frame[0];
    let len = frame[1] as usize;
    let payload = &frame[2..frame.len().min(2 + len)];

    let Some(cmd) = CmdId::from_byte(op) else {
        log::warn!("realcom: unknown command 0x{:02X} on channel {}", op, channel.channel_index);
        return None;
    };

    let ch = channel.channel_index;
    match cmd {
        CmdId::PortInit => {
            if payload.len() < 7 {
                return None;
            }
            let baud_idx = payload[0] as usize;
            let lcr = payload[1];
            let dtr = payload[2] != 0;
            let rts = payload[3] != 0;
            let rts_cts = payload[4] != 0;
            let xon_xoff = payload[5] != 0;

            let baud = BAUD_TABLE.get(baud_idx).copied().unwrap_or(9600);
            channel.serial.baud = baud;
            channel.serial.data_bits = data_bits_from_bits(lcr);
            channel.serial.stop_bits = if lcr & 0x04 != 0 { StopBits::Two } else { StopBits::One };
            channel.serial.parity = parity_from_bits((lcr >> 3) & 0x07);
            channel.serial.dtr = dtr;
            channel.serial.rts = rts;
            channel.serial.rts_cts = rts_cts;
            channel.serial.xon_xoff = xon_xoff;

            if uart.configure(ch, &channel.serial).is_err() {
                channel.uart_state = UartState::Error;
                return None;
            }
            let _ = uart.set_modem(ch, dtr, rts);
            channel.uart_state = UartState::Opened;
            channel.recompute_packet_size(channel.send_interval_ms.max(1));
            Some(vec![op, 0x03, 0x00, 0x00, 0x00])
        }
        CmdId::SetBaud => {
            if payload.len() < 4 {
                return None;
            }
            let baud = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            channel.serial.baud = baud;
            if uart.configure(ch, &channel.serial).is_err() {
                channel.uart_state = UartState::Error;
            }
            channel.recompute_packet_size(channel.send_interval_ms.max(1));
            Some(ok_reply(op))
        }
        CmdId::XonXoff => {
            channel.serial.xon_xoff = payload.first().map(|&b| b != 0).unwrap_or(false);
            Some(ok_reply(op))
        }
        CmdId::TxFifo => {
            channel.serial.fifo_enable = payload.first().map(|&b| b != 0).unwrap_or(true);
            Some(ok_reply(op))
        }
        CmdId::LineCtrl => {
            if let Some(&lcr) = payload.first() {
                channel.serial.data_bits = data_bits_from_bits(lcr);
                channel.serial.stop_bits = if lcr & 0x04 != 0 { StopBits::Two } else { StopBits::One };
                channel.serial.parity = parity_from_bits((lcr >> 3) & 0x07);
                let _ = uart.configure(ch, &channel.serial);
            }
            Some(ok_reply(op))
        }
        CmdId::SetXon => {
            channel.serial.xon_xoff = true;
            Some(ok_reply(op))
        }
        CmdId::SetXoff => {
            channel.serial.xon_xoff = false;
            Some(ok_reply(op))
        }
        CmdId::StartBreak => {
            channel.serial.break_active = true;
            uart.break_on(ch);
            Some(ok_reply(op))
        }
        CmdId::StopBreak => {
            channel.serial.break_active = false;
            uart.break_off(ch);
            Some(ok_reply(op))
        }
        CmdId::WaitOQueue => Some(vec![op, 0x02, 0x00, 0x00]),
        CmdId::Flush => {
            channel.buffer_uart.init();
            channel.buffer_net.init();
            Some(ok_reply(op))
        }
        CmdId::Alive | CmdId::Notify => Some(ok_reply(op)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uart::SimUart;

    #[test]
    fn port_init_opens_uart_and_acks() {
        let mut channel = Channel::new(0);
        let mut uart = SimUart::new(1);
        // baud index 10 = 115200, 8N1, DTR=1, no RTS, no flow, no XON/XOFF
        let frame = [0x2C, 0x07, 0x0A, 0x03, 0x01, 0x00, 0x00, 0x00, 0x00];
        let reply = handle_frame(&mut channel, &mut uart, &frame).unwrap();
        assert_eq!(reply, vec![0x2C, 0x03, 0x00, 0x00, 0x00]);
        assert_eq!(channel.uart_state, UartState::Opened);
        assert_eq!(channel.serial.baud, 115200);
        assert!(matches!(channel.serial.data_bits, DataBits::Eight));
    }

    #[test]
    fn set_baud_acks_ok() {
        let mut channel = Channel::new(0);
        let mut uart = SimUart::new(1);
        let frame = [0x17, 0x04, 0x00, 0x01, 0xC2, 0x00]; // 115200 big-endian
        let reply = handle_frame(&mut channel, &mut uart, &frame).unwrap();
        assert_eq!(reply, vec![0x17, b'O', b'K']);
        assert_eq!(channel.serial.baud, 115200);
    }

    #[test]
    fn unknown_command_produces_no_reply() {
        let mut channel = Channel::new(0);
        let mut uart = SimUart::new(1);
        let frame = [0xFE, 0x00];
        assert!(handle_frame(&mut channel, &mut uart, &frame).is_none());
    }

    #[test]
    fn flush_clears_buffers() {
        let mut channel = Channel::new(0);
        let mut uart = SimUart::new(1);
        channel.buffer_uart.enqueue(b"stale");
        let frame = [0x14, 0x00];
        let reply = handle_frame(&mut channel, &mut uart, &frame).unwrap();
        assert_eq!(reply, vec![0x14, b'O', b'K']);
        assert!(channel.buffer_uart.is_empty());
    }
}
