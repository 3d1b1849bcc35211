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

//! # Device Lifecycle Management
//!
//! The coarse security state machine of the MCU. Transitions form a
//! one-way ladder unless the session holds an authentication key;
//! `LCK_BOOT` is terminal, the boot firmware stops answering after
//! entering it.

use std::{
    error::Error as StdError,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

/// A device lifecycle state.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DlmState {
    /// Chip manufacturing.
    Cm,
    /// Secure software development.
    Ssd,
    /// Non-secure software development.
    Nsecsd,
    /// Deployed.
    Dpl,
    /// Debug locked.
    LckDbg,
    /// Boot interface locked. Terminal.
    LckBoot,
    /// Return-material-authorization requested.
    RmaReq,
    /// Return-material-authorization acknowledged.
    RmaAck,
}

impl DlmState {
    /// Decode the on-wire state byte.
    pub fn from_code(code: u8) -> Option<DlmState> {
        match code {
            0x01 => Some(DlmState::Cm),
            0x02 => Some(DlmState::Ssd),
            0x03 => Some(DlmState::Nsecsd),
            0x04 => Some(DlmState::Dpl),
            0x05 => Some(DlmState::LckDbg),
            0x06 => Some(DlmState::LckBoot),
            0x07 => Some(DlmState::RmaReq),
            0x08 => Some(DlmState::RmaAck),
            _ => None,
        }
    }

    /// The on-wire state byte.
    #[inline]
    pub fn code(&self) -> u8 {
        match *self {
            DlmState::Cm => 0x01,
            DlmState::Ssd => 0x02,
            DlmState::Nsecsd => 0x03,
            DlmState::Dpl => 0x04,
            DlmState::LckDbg => 0x05,
            DlmState::LckBoot => 0x06,
            DlmState::RmaReq => 0x07,
            DlmState::RmaAck => 0x08,
        }
    }

    /// Whether the boot firmware stops answering after entering this
    /// state.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(*self, DlmState::LckBoot)
    }
}

impl Display for DlmState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let name = match *self {
            DlmState::Cm => "CM",
            DlmState::Ssd => "SSD",
            DlmState::Nsecsd => "NSECSD",
            DlmState::Dpl => "DPL",
            DlmState::LckDbg => "LCK_DBG",
            DlmState::LckBoot => "LCK_BOOT",
            DlmState::RmaReq => "RMA_REQ",
            DlmState::RmaAck => "RMA_ACK",
        };
        write!(fmt, "{}", name)
    }
}

#[derive(Debug)]
pub struct ParseDlmStateError;

impl Display for ParseDlmStateError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "invalid value, state must be one of: `cm`, `ssd`, \
             `nsecsd`, `dpl`, `lck_dbg`, `lck_boot`, `rma_req`, \
             `rma_ack`"
        )
    }
}

impl StdError for ParseDlmStateError {}

impl FromStr for DlmState {
    type Err = ParseDlmStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cm" => Ok(DlmState::Cm),
            "ssd" => Ok(DlmState::Ssd),
            "nsecsd" => Ok(DlmState::Nsecsd),
            "dpl" => Ok(DlmState::Dpl),
            "lck_dbg" | "lck-dbg" => Ok(DlmState::LckDbg),
            "lck_boot" | "lck-boot" => Ok(DlmState::LckBoot),
            "rma_req" | "rma-req" => Ok(DlmState::RmaReq),
            "rma_ack" | "rma-ack" => Ok(DlmState::RmaAck),
            _ => Err(ParseDlmStateError),
        }
    }
}

/// Whether the device accepts a transition between two lifecycle
/// states. `authenticated` widens the edge set with the key-gated
/// re-entry and RMA transitions.
pub fn can_transit(
    from: DlmState,
    to: DlmState,
    authenticated: bool,
) -> bool {
    use self::DlmState::*;

    let unauthenticated = matches!(
        (from, to),
        (Cm, Ssd)
            | (Ssd, Nsecsd)
            | (Ssd, Dpl)
            | (Nsecsd, Dpl)
            | (Dpl, LckDbg)
            | (Dpl, LckBoot)
            | (LckDbg, LckBoot)
    );
    if unauthenticated {
        return true;
    }

    authenticated
        && matches!(
            (from, to),
            (Nsecsd, Ssd)
                | (Dpl, Ssd)
                | (Dpl, Nsecsd)
                | (Ssd, RmaReq)
                | (Nsecsd, RmaReq)
                | (Dpl, RmaReq)
        )
}

/// Typed key slot used by the key-set and key-verify commands.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KeySlot {
    SecureDebug,
    NonSecureDebug,
    Rma,
}

impl KeySlot {
    /// The on-wire slot byte.
    #[inline]
    pub fn code(&self) -> u8 {
        match *self {
            KeySlot::SecureDebug => 1,
            KeySlot::NonSecureDebug => 2,
            KeySlot::Rma => 3,
        }
    }
}

impl Display for KeySlot {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let name = match *self {
            KeySlot::SecureDebug => "secdbg",
            KeySlot::NonSecureDebug => "nonsecdbg",
            KeySlot::Rma => "rma",
        };
        write!(fmt, "{}", name)
    }
}

#[derive(Debug)]
pub struct ParseKeySlotError;

impl Display for ParseKeySlotError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "invalid value, key type must be one of: `secdbg`, \
             `nonsecdbg`, `rma`"
        )
    }
}

impl StdError for ParseKeySlotError {}

impl FromStr for KeySlot {
    type Err = ParseKeySlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "secdbg" => Ok(KeySlot::SecureDebug),
            "nonsecdbg" => Ok(KeySlot::NonSecureDebug),
            "rma" => Ok(KeySlot::Rma),
            _ => Err(ParseKeySlotError),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use super::DlmState::*;

    #[test]
    fn test_code_roundtrip() {
        for code in 0x01..=0x08 {
            let state = DlmState::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }
        assert_eq!(DlmState::from_code(0x00), None);
        assert_eq!(DlmState::from_code(0x09), None);
    }

    #[test]
    fn test_unauthenticated_edges() {
        assert!(can_transit(Cm, Ssd, false));
        assert!(can_transit(Ssd, Nsecsd, false));
        assert!(can_transit(Ssd, Dpl, false));
        assert!(can_transit(Nsecsd, Dpl, false));
        assert!(can_transit(Dpl, LckDbg, false));
        assert!(can_transit(Dpl, LckBoot, false));
        assert!(can_transit(LckDbg, LckBoot, false));

        // The ladder is one-way without a key.
        assert!(!can_transit(Ssd, Cm, false));
        assert!(!can_transit(Dpl, Ssd, false));
        assert!(!can_transit(Nsecsd, Ssd, false));
        assert!(!can_transit(Ssd, RmaReq, false));
        assert!(!can_transit(LckBoot, Dpl, true));
    }

    #[test]
    fn test_authenticated_edges() {
        assert!(can_transit(Nsecsd, Ssd, true));
        assert!(can_transit(Dpl, Ssd, true));
        assert!(can_transit(Dpl, Nsecsd, true));
        assert!(can_transit(Ssd, RmaReq, true));
        assert!(can_transit(Dpl, RmaReq, true));

        // Authentication still never resurrects a locked device.
        assert!(!can_transit(LckBoot, Ssd, true));
        assert!(!can_transit(RmaAck, Ssd, true));
    }

    #[test]
    fn test_terminal() {
        assert!(LckBoot.is_terminal());
        assert!(!LckDbg.is_terminal());
        assert!(!RmaAck.is_terminal());
    }

    #[test]
    fn test_from_str() {
        assert_eq!("ssd".parse::<DlmState>().unwrap(), Ssd);
        assert_eq!("LCK_BOOT".parse::<DlmState>().unwrap(), LckBoot);
        assert_eq!("rma-req".parse::<DlmState>().unwrap(), RmaReq);
        assert!("production".parse::<DlmState>().is_err());

        assert_eq!(
            "secdbg".parse::<KeySlot>().unwrap(),
            KeySlot::SecureDebug
        );
        assert!("master".parse::<KeySlot>().is_err());
    }
}
