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

use anyhow::Result;

use ra_dfu::ports::{PortInfo, RENESAS_VID};

pub fn list() -> Result<()> {
    let ports = PortInfo::list_all();

    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    for port in ports {
        let boot = match port.usb_info {
            Some(ref usb) if usb.vid == RENESAS_VID => " [RA boot]",
            _ => "",
        };
        println!(
            "- {} (up to {} bps){}",
            port.describe(),
            port.max_rate(),
            boot
        );
    }

    Ok(())
}
