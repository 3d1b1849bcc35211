// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Based on the Renesas RA family standard boot firmware system
// specification (R01AN5372).
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

pub const CMD_INQUIRE: u8           = 0x00;
pub const CMD_ERASE: u8             = 0x12;
pub const CMD_WRITE: u8             = 0x13;
pub const CMD_READ: u8              = 0x15;
pub const CMD_CRC: u8               = 0x18;
pub const CMD_KEY_SET: u8           = 0x28;
pub const CMD_KEY_VERIFY: u8        = 0x29;
pub const CMD_USER_KEY_SET: u8      = 0x2B;
pub const CMD_DLM_STATE: u8         = 0x2C;
pub const CMD_USER_KEY_VERIFY: u8   = 0x2D;
pub const CMD_ID_AUTH: u8           = 0x30;
pub const CMD_BAUD: u8              = 0x34;
pub const CMD_SIGNATURE: u8         = 0x3A;
pub const CMD_AREA_INFO: u8         = 0x3B;
pub const CMD_BOUNDARY_SET: u8      = 0x4E;
pub const CMD_BOUNDARY: u8          = 0x4F;
pub const CMD_INITIALIZE: u8        = 0x50;
pub const CMD_PARAM_SET: u8         = 0x51;
pub const CMD_PARAM: u8             = 0x52;
pub const CMD_DLM_TRANSIT: u8       = 0x71;
pub const CMD_DLM_AUTH_TRANSIT: u8  = 0x72;

/// Error status bit OR'd into the response command byte.
pub const STATUS_ERR: u8            = 0x80;

/// Start-of-data byte of a request frame.
pub const SOD_REQUEST: u8           = 0x01;
/// Start-of-data byte of a reply or continuation frame.
pub const SOD_REPLY: u8             = 0x81;
/// End-of-frame byte.
pub const ETX: u8                   = 0x03;

/// Byte used to synchronize the line after reset.
pub const SYNC: u8                  = 0x00;
/// Generic-code byte confirming the boot firmware after sync.
pub const GENERIC_CODE: u8          = 0x55;

/// Boot code reply: Cortex-M4/M23 groups (RA2, RA4).
pub const BOOT_CODE_CM4: u8         = 0xC3;
/// Boot code reply: Cortex-M85 group (RA8).
pub const BOOT_CODE_CM85: u8        = 0xC5;
/// Boot code reply: Cortex-M33 groups (RA4M2+, RA6).
pub const BOOT_CODE_CM33: u8        = 0xC6;

pub const ERR_UNSUPPORTED: u8       = 0x0C;
pub const ERR_PACKET: u8            = 0xC1;
pub const ERR_CHECKSUM: u8          = 0xC2;
pub const ERR_FLOW: u8              = 0xC3;
pub const ERR_ADDRESS: u8           = 0xD0;
pub const ERR_BAUD_MARGIN: u8       = 0xD4;
pub const ERR_PROTECTION: u8        = 0xDA;
pub const ERR_ID_MISMATCH: u8       = 0xDB;
pub const ERR_SERIAL_DISABLED: u8   = 0xDC;
pub const ERR_ERASE: u8             = 0xE1;
pub const ERR_WRITE: u8             = 0xE2;
pub const ERR_SEQUENCER: u8         = 0xE7;

/// Maximum payload carried by a single framed packet.
pub const MAX_PAYLOAD: usize        = 1024;
/// Maximum total packet size on the wire.
pub const MAX_PACKET: usize         = MAX_PAYLOAD + 6;
/// Payload size of one bulk read/write chunk.
pub const CHUNK_SIZE: usize         = 1024;

/// Line rate the boot firmware listens on after reset.
pub const INITIAL_BAUD: u32         = 9_600;
/// Rate to fall back to when a negotiated rate fails verification.
pub const FALLBACK_BAUD: u32        = 115_200;

/// Timeout for the first byte of a reply, in milliseconds.
pub const TIMEOUT_FIRST_MS: u64     = 100;
/// Timeout between bytes once a reply has started arriving.
pub const TIMEOUT_NEXT_MS: u64      = 20;
/// Timeout for commands the device services slowly (erase, CRC,
/// initialize).
pub const TIMEOUT_LONG_MS: u64      = 1_000;

/// Bound on sync/confirm retries during the handshake.
pub const HANDSHAKE_RETRIES: usize  = 20;

/// Id code requesting a total-area erase on devices whose OSIS
/// setting allows it.
pub const ALL_ERASE_ID: [u8; 16] =
    *b"ALeRASE\xFF\xFF\xFF\xFF\xFF\xFF\xFF\xFF\xFF";

/// Address of the 128-bit OSIS id-protection words.
pub const OSIS_ADDR: u32            = 0x0100_A150;
