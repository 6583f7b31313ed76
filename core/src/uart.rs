//! UART HAL: the per-channel register surface the realtime scheduler drives.
//!
//! [`SimUart`] is a loopback-capable in-memory stand-in used by tests and by
//! `nport-serverd` when run without real serial hardware attached.

use crate::channel::{Parity, SerialParams};
use crate::error::HalError;
use std::collections::VecDeque;

pub trait UartHal: Send {
    fn configure(&mut self, ch: usize, params: &SerialParams) -> Result<(), HalError>;
    fn set_modem(&mut self, ch: usize, dtr: bool, rts: bool) -> Result<(), HalError>;
    fn break_on(&mut self, ch: usize);
    fn break_off(&mut self, ch: usize);
    fn tx_ready(&self, ch: usize) -> bool;
    fn tx_byte(&mut self, ch: usize, b: u8) -> Result<(), HalError>;
    fn rx_drain(&mut self, ch: usize, buf: &mut [u8]) -> usize;
    fn led_tx(&mut self, ch: usize, on: bool);
    fn led_rx(&mut self, ch: usize, on: bool);
    fn led_port(&mut self, ch: usize, on: bool);
}

#[derive(Default)]
struct SimPort {
    configured: bool,
    rx_fifo: VecDeque<u8>,
    loopback: bool,
}

/// A simulated UART bank: each port has an RX FIFO fillable by tests, and
/// optionally echoes transmitted bytes back into its own RX FIFO
/// (`set_loopback`) to exercise the serial-echo data path without hardware.
pub struct SimUart {
    ports: Vec<SimPort>,
}

impl SimUart {
    pub fn new(num_ports: usize) -> Self {
        SimUart {
            ports: (0..num_ports).map(|_| SimPort::default()).collect(),
        }
    }

    pub fn set_loopback(&mut self, ch: usize, enabled: bool) {
        self.ports[ch].loopback = enabled;
    }

    /// Injects bytes as if received from the wire, for test setup.
    pub fn inject_rx(&mut self, ch: usize, data: &[u8]) {
        self.ports[ch].rx_fifo.extend(data.iter().copied());
    }
}

impl UartHal for SimUart {
    fn configure(&mut self, ch: usize, params: &SerialParams) -> Result<(), HalError> {
        let port = self
            .ports
            .get_mut(ch)
            .ok_or(HalError::ConfigureFailed(ch as u8))?;
        if params.baud == 0 || !matches!(params.parity, Parity::None | Parity::Odd | Parity::Even | Parity::Mark | Parity::Space) {
            return Err(HalError::ConfigureFailed(ch as u8));
        }
        port.configured = true;
        Ok(())
    }

    fn set_modem(&mut self, _ch: usize, _dtr: bool, _rts: bool) -> Result<(), HalError> {
        Ok(())
    }

    fn break_on(&mut self, _ch: usize) {}
    fn break_off(&mut self, _ch: usize) {}

    fn tx_ready(&self, _ch: usize) -> bool {
        true
    }

    fn tx_byte(&mut self, ch: usize, b: u8) -> Result<(), HalError> {
        if let Some(port) = self.ports.get_mut(ch) {
            if port.loopback {
                port.rx_fifo.push_back(b);
            }
            Ok(())
        } else {
            Err(HalError::ConfigureFailed(ch as u8))
        }
    }

    fn rx_drain(&mut self, ch: usize, buf: &mut [u8]) -> usize {
        let Some(port) = self.ports.get_mut(ch) else {
            return 0;
        };
        let mut n = 0;
        while n < buf.len() {
            match port.rx_fifo.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn led_tx(&mut self, _ch: usize, _on: bool) {}
    fn led_rx(&mut self, _ch: usize, _on: bool) {}
    fn led_port(&mut self, _ch: usize, _on: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_echoes_tx_into_rx() {
        let mut uart = SimUart::new(1);
        uart.set_loopback(0, true);
        uart.tx_byte(0, b'H').unwrap();
        uart.tx_byte(0, b'i').unwrap();
        let mut buf = [0u8; 4];
        let n = uart.rx_drain(0, &mut buf);
        assert_eq!(&buf[..n], b"Hi");
    }

    #[test]
    fn configure_rejects_zero_baud() {
        let mut uart = SimUart::new(1);
        let mut params = SerialParams::default();
        params.baud = 0;
        assert!(uart.configure(0, &params).is_err());
    }
}
