// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Transport
//!
//! Byte-oriented full-duplex channel over a serial port. Reads are
//! bounded by a per-call timeout; a timeout returns zero bytes rather
//! than an error so callers can distinguish silence from I/O failure.

use std::{
    io::{self, Read, Write},
    time::Duration,
};

use serial::SerialPort;

use crate::constants::{INITIAL_BAUD, TIMEOUT_NEXT_MS};
use crate::Error;

/// Line rates the engine will negotiate, highest first.
pub const BAUD_LADDER: &[u32] = &[
    4_000_000, 3_000_000, 2_000_000, 1_500_000, 1_000_000, 921_600,
    460_800, 230_400, 115_200, 57_600, 38_400, 19_200, 9_600,
];

/// Highest supported rate that does not exceed `max`.
pub fn best_rate(max: u32) -> u32 {
    BAUD_LADDER
        .iter()
        .copied()
        .find(|&rate| rate <= max)
        .unwrap_or(INITIAL_BAUD)
}

/// Serial settings used by the boot firmware: 8N1, no flow control.
pub fn port_settings(rate: u32) -> serial::PortSettings {
    serial::PortSettings {
        baud_rate: baud_rate(rate),
        char_size: serial::CharSize::Bits8,
        parity: serial::Parity::ParityNone,
        stop_bits: serial::StopBits::Stop1,
        flow_control: serial::FlowControl::FlowNone,
    }
}

fn baud_rate(rate: u32) -> serial::BaudRate {
    match rate {
        9_600 => serial::BaudRate::Baud9600,
        19_200 => serial::BaudRate::Baud19200,
        38_400 => serial::BaudRate::Baud38400,
        57_600 => serial::BaudRate::Baud57600,
        115_200 => serial::BaudRate::Baud115200,
        other => serial::BaudRate::BaudOther(other as usize),
    }
}

/// An opened serial channel to the boot firmware.
pub struct Transport<P> {
    port: P,
    rate: u32,
    uart: bool,
}

impl<P> Transport<P>
where
    P: SerialPort,
{
    /// Take ownership of an opened port, program the initial 9600 bps
    /// line and discard anything pending in either direction.
    ///
    /// `uart` marks a raw UART link; USB-CDC links ignore the line
    /// rate and skip baud restoration on close.
    pub fn new(port: P, uart: bool) -> Result<Self, Error> {
        let mut link = Transport { port, rate: INITIAL_BAUD, uart };

        link.port
            .configure(&port_settings(INITIAL_BAUD))
            .map_err(io::Error::from)?;
        link.flush()?;

        Ok(link)
    }

    /// Current line rate in bps.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Whether this is a raw UART link.
    pub fn is_uart(&self) -> bool {
        self.uart
    }

    /// Write the whole buffer.
    pub fn send(&mut self, buf: &[u8]) -> Result<(), Error> {
        log::trace!("send {} bytes: {:02X?}", buf.len(), buf);

        self.port.write_all(buf)?;
        self.port.flush()?;

        Ok(())
    }

    /// Read up to `buf.len()` bytes within `timeout_ms`. Returns the
    /// number of bytes read; zero means the window elapsed silently.
    pub fn recv(
        &mut self,
        buf: &mut [u8],
        timeout_ms: u64,
    ) -> Result<usize, Error> {
        self.port
            .set_timeout(Duration::from_millis(timeout_ms))
            .map_err(io::Error::from)?;

        match self.port.read(buf) {
            Ok(0) => Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial port closed",
            ))),
            Ok(n) => {
                log::trace!("recv {} bytes: {:02X?}", n, &buf[..n]);
                Ok(n)
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Fill `buf` completely. The first byte is awaited for
    /// `first_timeout_ms`; once the reply has started, each further
    /// window shrinks to the continuation timeout.
    pub fn recv_exact(
        &mut self,
        buf: &mut [u8],
        first_timeout_ms: u64,
    ) -> Result<(), Error> {
        let mut filled = 0;
        let mut timeout = first_timeout_ms;

        while filled < buf.len() {
            let n = self.recv(&mut buf[filled..], timeout)?;
            if n == 0 {
                return Err(Error::Timeout);
            }
            filled += n;
            timeout = TIMEOUT_NEXT_MS;
        }

        Ok(())
    }

    /// Flush pending output and discard pending input.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.port.flush()?;

        let mut scratch = [0u8; 64];
        while self.recv(&mut scratch, TIMEOUT_NEXT_MS)? != 0 {}

        Ok(())
    }

    /// Reprogram the line rate. Only called after the device has
    /// acknowledged the matching baud command.
    pub fn set_rate(&mut self, rate: u32) -> Result<(), Error> {
        self.port
            .configure(&port_settings(rate))
            .map_err(io::Error::from)?;
        self.rate = rate;

        log::debug!("line rate changed to {} bps", rate);

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_best_rate() {
        assert_eq!(best_rate(4_000_000), 4_000_000);
        assert_eq!(best_rate(5_000_000), 4_000_000);
        assert_eq!(best_rate(1_000_000), 1_000_000);
        assert_eq!(best_rate(999_999), 921_600);
        assert_eq!(best_rate(115_200), 115_200);
        assert_eq!(best_rate(9_600), 9_600);
        assert_eq!(best_rate(0), 9_600);
    }

    #[test]
    fn test_best_rate_monotone() {
        let probes = [0u32, 9_599, 9_600, 100_000, 921_600, 4_000_001];
        let mut last = 0;
        for &max in &probes {
            let rate = best_rate(max);
            assert!(rate >= last, "ladder not monotone at {}", max);
            last = rate;
        }
    }
}
