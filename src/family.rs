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

use std::fmt::{self, Display, Formatter};

use crate::constants::{BOOT_CODE_CM33, BOOT_CODE_CM4, BOOT_CODE_CM85};

/// The device group, inferred from the boot code byte returned during
/// the handshake and echoed in the signature reply.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Family {
    /// RA2 and RA4 groups (Cortex-M23 / Cortex-M4).
    Ra2Ra4,
    /// RA4M2 and newer, RA6 groups (Cortex-M33).
    Ra4M2Ra6,
    /// RA8 group (Cortex-M85).
    Ra8,
}

impl Family {
    /// Map a boot code byte to the device group.
    pub fn from_boot_code(code: u8) -> Option<Family> {
        match code {
            BOOT_CODE_CM4 => Some(Family::Ra2Ra4),
            BOOT_CODE_CM33 => Some(Family::Ra4M2Ra6),
            BOOT_CODE_CM85 => Some(Family::Ra8),
            _ => None,
        }
    }

    /// The boot code byte this group answers with.
    #[inline]
    pub fn boot_code(&self) -> u8 {
        match *self {
            Family::Ra2Ra4 => BOOT_CODE_CM4,
            Family::Ra4M2Ra6 => BOOT_CODE_CM33,
            Family::Ra8 => BOOT_CODE_CM85,
        }
    }

    /// Whether the device uses the OSIS id code for authentication.
    ///
    /// - **Note:** only the [`Family::Ra2Ra4`] group; the TrustZone
    ///   groups authenticate through DLM keys instead.
    #[inline]
    pub fn supports_id_code(&self) -> bool {
        matches!(*self, Family::Ra2Ra4)
    }

    /// Whether the device implements the DLM state machine.
    ///
    /// - **Note:** supported on [`Family::Ra4M2Ra6`] and
    ///   [`Family::Ra8`].
    #[inline]
    pub fn supports_dlm(&self) -> bool {
        matches!(*self, Family::Ra4M2Ra6 | Family::Ra8)
    }

    /// Whether the device accepts TrustZone boundary commands.
    ///
    /// - **Note:** supported on [`Family::Ra4M2Ra6`] and
    ///   [`Family::Ra8`].
    #[inline]
    pub fn supports_boundary(&self) -> bool {
        matches!(*self, Family::Ra4M2Ra6 | Family::Ra8)
    }

    /// Whether the device accepts wrapped-key injection commands.
    ///
    /// - **Note:** supported on [`Family::Ra4M2Ra6`] and
    ///   [`Family::Ra8`].
    #[inline]
    pub fn supports_key_injection(&self) -> bool {
        matches!(*self, Family::Ra4M2Ra6 | Family::Ra8)
    }

    /// Name of the CPU core the boot code identifies.
    #[inline]
    pub fn core_name(&self) -> &'static str {
        match *self {
            Family::Ra2Ra4 => "Cortex-M4/M23",
            Family::Ra4M2Ra6 => "Cortex-M33",
            Family::Ra8 => "Cortex-M85",
        }
    }
}

impl Display for Family {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Family::Ra2Ra4 => write!(fmt, "RA2/RA4"),
            Family::Ra4M2Ra6 => write!(fmt, "RA4M2/RA6"),
            Family::Ra8 => write!(fmt, "RA8"),
        }
    }
}
