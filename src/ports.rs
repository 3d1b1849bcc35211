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

//! # Serial port discovery
//!
//! Enumerate candidate ports with their USB metadata so the CLI can
//! list them and the baud negotiation can respect the adapter's rate
//! ceiling.

use std::ffi::OsString;

#[cfg(target_os = "linux")]
mod list_linux;

/// USB vendor id of the Renesas on-chip USB-CDC boot interface.
pub const RENESAS_VID: u16 = 0x045B;

/// Information about an available serial port.
#[derive(Debug)]
pub struct PortInfo {
    pub port: OsString,
    pub name: OsString,
    pub usb_info: Option<PortUsbInfo>,
}

impl PortInfo {
    /// List all serial ports on the system.
    #[cfg(target_os = "linux")]
    pub fn list_all() -> Vec<PortInfo> {
        self::list_linux::list_all()
    }

    /// Discovery is sysfs-based; other platforms get no listing.
    #[cfg(not(target_os = "linux"))]
    pub fn list_all() -> Vec<PortInfo> {
        Vec::new()
    }

    /// Highest line rate the attached adapter is known to sustain,
    /// keyed on the USB vendor id. Non-USB ports are assumed to be
    /// plain 16550-class UARTs.
    pub fn max_rate(&self) -> u32 {
        match self.usb_info {
            Some(ref usb) => match usb.vid {
                // The on-chip CDC interface runs at USB speed; the
                // reported rate is a formality.
                RENESAS_VID => 4_000_000,
                // FTDI
                0x0403 => 3_000_000,
                // WCH CH34x
                0x1A86 => 2_000_000,
                // Silicon Labs CP210x
                0x10C4 => 921_600,
                // Prolific PL2303
                0x067B => 921_600,
                _ => 1_000_000,
            },
            None => 115_200,
        }
    }

    /// One-line human summary for port listings.
    pub fn describe(&self) -> String {
        match self.usb_info {
            Some(ref usb) => {
                let mut line = format!(
                    "`{}` {:04X}:{:04X}",
                    self.port.to_string_lossy(),
                    usb.vid,
                    usb.pid
                );
                if let Some(ref manufacturer) = usb.manufacturer {
                    line.push(' ');
                    line.push_str(manufacturer);
                }
                if let Some(ref product) = usb.product {
                    line.push(' ');
                    line.push_str(product);
                }
                if let Some(ref serial) = usb.serial {
                    line.push_str(&format!(" (serial {})", serial));
                }
                line
            }
            None => format!("`{}`", self.port.to_string_lossy()),
        }
    }

    /// Best-effort re-enumeration of the USB device behind the port,
    /// for adapters wedged mid-session. Needs permissions on the
    /// sysfs `authorized` attribute.
    #[cfg(target_os = "linux")]
    pub fn reset_usb(&self) -> std::io::Result<()> {
        self::list_linux::reset_usb(std::path::Path::new(&self.port))
    }
}

/// Information about USB serial ports.
#[derive(Debug)]
pub struct PortUsbInfo {
    /// Number of interfaces in this device.
    pub num_if: usize,
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// Serial number string.
    pub serial: Option<String>,
    /// Device manufacturer.
    pub manufacturer: Option<String>,
    /// Device product description.
    pub product: Option<String>,
    /// Device product interface.
    pub interface: Option<String>,
}
