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

use std::io;

use thiserror::Error;

use crate::area::Operation;
use crate::packet::{error_description, error_name};

/// Errors surfaced by the boot-protocol engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Packet SOD/ETX/length invalid, or a short frame.
    #[error("packet framing error: {0}")]
    Framing(&'static str),

    /// Checksum mismatch on an otherwise well-framed packet.
    #[error("packet checksum mismatch, expected {expected:#04X}, \
             found {found:#04X}")]
    Checksum { expected: u8, found: u8 },

    /// Expected reply bytes did not arrive within the window.
    #[error("timed out waiting for a reply")]
    Timeout,

    /// The reply carried the error-status bit.
    #[error("boot firmware error {code:#04X} ({}) in reply to command \
             {cmd:#04X}: {}", error_name(*.code), error_description(*.code))]
    Mcu { cmd: u8, code: u8 },

    /// Caller-provided address or size incompatible with the area's
    /// alignment. An `align` of zero means the area does not support
    /// the operation at all.
    #[error("address {addr:#010X} incompatible with {op} alignment \
             {align:#X}")]
    Alignment { op: Operation, addr: u32, align: u32 },

    /// Address not covered by any discovered area.
    #[error("address {addr:#010X} is outside every device area")]
    UnknownArea { addr: u32 },

    /// Unexpected response, or a command issued in the wrong state.
    #[error("protocol state error: {0}")]
    Protocol(String),

    /// Underlying byte-stream failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record codec failure (checksum, missing EOF, bad digits).
    #[error("bad input file: {0}")]
    BadInputFile(String),
}

impl Error {
    /// The MCU status code, when the error is a boot firmware reply.
    pub fn mcu_code(&self) -> Option<u8> {
        match *self {
            Error::Mcu { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<serial::Error> for Error {
    fn from(e: serial::Error) -> Error {
        Error::Io(e.into())
    }
}
