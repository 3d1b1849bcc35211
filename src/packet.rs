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

//! # Packet codec
//!
//! Every command and reply travels in one frame:
//!
//! ```text
//! SOD | LNH LNL | RCB | payload ... | SUM | ETX
//! ```
//!
//! `LNH:LNL` is big-endian and equals the payload length plus one (it
//! counts the RCB byte). `SUM` is the two's complement of the byte sum
//! of `LNH`, `LNL`, `RCB` and the payload. A reply whose RCB has the
//! high bit set carries the MCU status code in its first payload byte.

use crate::constants::{
    ETX, MAX_PAYLOAD, SOD_REPLY, SOD_REQUEST, STATUS_ERR,
};
use crate::Error;

/// Two's-complement checksum over the length field, the command byte
/// and the payload.
pub fn checksum(cmd: u8, payload: &[u8]) -> u8 {
    let len = payload.len() as u16 + 1;
    let mut sum = ((len >> 8) as u8)
        .wrapping_add(len as u8)
        .wrapping_add(cmd);
    for byte in payload {
        sum = sum.wrapping_add(*byte);
    }

    sum.wrapping_neg()
}

/// Frame a command. `continuation` selects the `0x81` start-of-data
/// used by chunk and ack frames inside a bulk flow; plain requests use
/// `0x01`.
pub fn pack(
    cmd: u8,
    payload: &[u8],
    continuation: bool,
) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Framing("payload exceeds 1024 bytes"));
    }

    let len = payload.len() as u16 + 1;
    let mut pkt = Vec::with_capacity(payload.len() + 6);

    pkt.push(if continuation { SOD_REPLY } else { SOD_REQUEST });
    pkt.push((len >> 8) as u8);
    pkt.push(len as u8);
    pkt.push(cmd);
    pkt.extend_from_slice(payload);
    pkt.push(checksum(cmd, payload));
    pkt.push(ETX);

    Ok(pkt)
}

/// Deframe a reply, returning the echoed command byte and the payload.
///
/// A reply with the error-status bit set surfaces as [`Error::Mcu`]
/// before the checksum is inspected, so a status code still reaches
/// the caller when the rest of the frame is suspect.
pub fn unpack(frame: &[u8]) -> Result<(u8, Vec<u8>), Error> {
    if frame.len() < 6 {
        return Err(Error::Framing("reply shorter than an empty frame"));
    }
    if frame[0] != SOD_REPLY {
        return Err(Error::Framing("bad start-of-data byte"));
    }

    let len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
    if len == 0 || len - 1 > MAX_PAYLOAD {
        return Err(Error::Framing("length field out of range"));
    }
    if frame.len() < len + 5 {
        return Err(Error::Framing("reply truncated"));
    }
    if frame[len + 4] != ETX {
        return Err(Error::Framing("bad end-of-frame byte"));
    }

    let rcb = frame[3];
    let payload = &frame[4..len + 3];

    if rcb & STATUS_ERR != 0 {
        let code = payload.first().copied().unwrap_or(0);
        return Err(Error::Mcu { cmd: rcb & !STATUS_ERR, code });
    }

    let expected = checksum(rcb, payload);
    if expected != frame[len + 3] {
        return Err(Error::Checksum { expected, found: frame[len + 3] });
    }

    Ok((rcb, payload.to_vec()))
}

/// Short name of an MCU status code.
pub fn error_name(code: u8) -> &'static str {
    use crate::constants::*;

    match code {
        ERR_UNSUPPORTED => "ERR_UNSU",
        ERR_PACKET => "ERR_PCKT",
        ERR_CHECKSUM => "ERR_CHKS",
        ERR_FLOW => "ERR_FLOW",
        ERR_ADDRESS => "ERR_ADDR",
        ERR_BAUD_MARGIN => "ERR_BAUD",
        ERR_PROTECTION => "ERR_PROT",
        ERR_ID_MISMATCH => "ERR_ID",
        ERR_SERIAL_DISABLED => "ERR_SERI",
        ERR_ERASE => "ERR_ERER",
        ERR_WRITE => "ERR_WRER",
        ERR_SEQUENCER => "ERR_SEQR",
        _ => "ERR_UNKNOWN",
    }
}

/// Human description of an MCU status code.
pub fn error_description(code: u8) -> &'static str {
    use crate::constants::*;

    match code {
        ERR_UNSUPPORTED => "command is not supported on this device",
        ERR_PACKET => "packet framing rejected by the device",
        ERR_CHECKSUM => "packet checksum rejected by the device",
        ERR_FLOW => "command issued out of sequence",
        ERR_ADDRESS => "address is invalid for this command",
        ERR_BAUD_MARGIN => "requested rate is outside the baud margin",
        ERR_PROTECTION => "operation refused by protection settings",
        ERR_ID_MISMATCH => "id code mismatch",
        ERR_SERIAL_DISABLED => "serial programming is disabled",
        ERR_ERASE => "erase operation failed",
        ERR_WRITE => "write operation failed",
        ERR_SEQUENCER => "flash sequencer failed",
        _ => "unknown status code",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::{CMD_BAUD, CMD_ERASE, CMD_INQUIRE};

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(CMD_ERASE, &[0x00]), 0xEC);
        assert_eq!(checksum(CMD_BAUD, &[0x00]), 0xCA);
        assert_eq!(checksum(CMD_INQUIRE, &[0x00]), 0xFE);
    }

    #[test]
    fn test_checksum_law() {
        // The byte sum of LNH, LNL, RCB, payload and SUM is zero for
        // every packed frame.
        for cmd in 0u16..=255 {
            let payload = [cmd as u8, 0x55, 0xAA];
            let pkt = pack(cmd as u8, &payload, false).unwrap();

            let sum = pkt[1..pkt.len() - 1]
                .iter()
                .fold(0u8, |acc, b| acc.wrapping_add(*b));
            assert_eq!(sum, 0, "law violated for cmd {:#04X}", cmd);
        }
    }

    #[test]
    fn test_roundtrip() {
        for cmd in (0u16..=255).step_by(7) {
            for len in &[0usize, 1, 16, 1024] {
                let payload: Vec<u8> =
                    (0..*len).map(|i| (i * 31) as u8).collect();
                // Only non-error command bytes round-trip; the high
                // bit marks an error reply.
                let cmd = cmd as u8 & !STATUS_ERR;
                let pkt = pack(cmd, &payload, true).unwrap();
                let (rcmd, rpayload) = unpack(&pkt).unwrap();
                assert_eq!(rcmd, cmd);
                assert_eq!(rpayload, payload);
            }
        }
    }

    #[test]
    fn test_pack_oversize() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            pack(0x15, &payload, false),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn test_unpack_ok() {
        let frame = [0x81, 0x00, 0x02, 0x00, 0x00, 0xFE, 0x03];
        let (cmd, payload) = unpack(&frame).unwrap();
        assert_eq!(cmd, 0x00);
        assert_eq!(payload, vec![0x00]);
    }

    #[test]
    fn test_unpack_mcu_error() {
        let frame = [0x81, 0x00, 0x02, 0x93, 0xC3, 0x38, 0x03];
        match unpack(&frame) {
            Err(Error::Mcu { cmd, code }) => {
                assert_eq!(cmd, 0x13);
                assert_eq!(code, 0xC3);
                assert_eq!(error_name(code), "ERR_FLOW");
            }
            other => panic!("expected MCU error, got {:?}", other),
        }
    }

    #[test]
    fn test_unpack_framing() {
        // Request SOD on a reply.
        let frame = [0x01, 0x00, 0x02, 0x00, 0x00, 0xFE, 0x03];
        assert!(matches!(unpack(&frame), Err(Error::Framing(_))));

        // Missing ETX.
        let frame = [0x81, 0x00, 0x02, 0x00, 0x00, 0xFE, 0x04];
        assert!(matches!(unpack(&frame), Err(Error::Framing(_))));

        // Short buffer.
        let frame = [0x81, 0x00, 0x02, 0x00];
        assert!(matches!(unpack(&frame), Err(Error::Framing(_))));

        // Length field runs past the buffer.
        let frame = [0x81, 0x00, 0x05, 0x00, 0x00, 0xFE, 0x03];
        assert!(matches!(unpack(&frame), Err(Error::Framing(_))));
    }

    #[test]
    fn test_unpack_checksum() {
        let frame = [0x81, 0x00, 0x02, 0x00, 0x00, 0xAA, 0x03];
        match unpack(&frame) {
            Err(Error::Checksum { expected, found }) => {
                assert_eq!(expected, 0xFE);
                assert_eq!(found, 0xAA);
            }
            other => panic!("expected checksum error, got {:?}", other),
        }
    }
}
