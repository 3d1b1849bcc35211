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

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use super::{PortInfo, PortUsbInfo};

fn glob(pat: &str) -> glob::Paths {
    glob::glob(pat).unwrap()
}

fn read_line<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let mut file = BufReader::new(File::open(path)?);

    let mut line = String::new();
    file.read_line(&mut line)?;

    Ok(line.trim().to_owned())
}

fn pathdir(mut path: PathBuf) -> PathBuf {
    path.pop();
    path
}

/// Sysfs directory of the USB interface behind a tty, if it is a USB
/// port at all.
fn usb_interface_dir<P>(port: P) -> io::Result<Option<PathBuf>>
where
    P: AsRef<Path>,
{
    let port = port.as_ref();

    let device_path = PathBuf::from("/sys/class/tty")
        .join(port.file_name().unwrap_or_default())
        .join("device");
    if !device_path.exists() {
        return Ok(None);
    }

    let subsystem = fs::canonicalize(
        fs::canonicalize(device_path.clone())?.join("subsystem"),
    )?
    .file_name()
    .map(|s| s.to_owned());

    Ok(match subsystem {
        Some(ref s) if s == "usb-serial" => {
            Some(pathdir(fs::canonicalize(device_path)?))
        }
        Some(ref s) if s == "usb" => Some(fs::canonicalize(device_path)?),
        _ => None,
    })
}

fn port_info<P>(port: P) -> io::Result<Option<PortInfo>>
where
    P: AsRef<Path>,
{
    let port = port.as_ref();

    let usb_info = match usb_interface_dir(port)? {
        Some(usb_int) => {
            let usb_dev = pathdir(usb_int.clone());

            let vid = u16::from_str_radix(
                &read_line(usb_dev.join("idVendor"))?,
                16,
            )
            .unwrap_or(0);
            let pid = u16::from_str_radix(
                &read_line(usb_dev.join("idProduct"))?,
                16,
            )
            .unwrap_or(0);

            Some(PortUsbInfo {
                num_if: read_line(usb_dev.join("bNumInterfaces"))
                    .unwrap_or_else(|_| "1".to_owned())
                    .parse()
                    .unwrap_or(1),
                vid,
                pid,
                serial: read_line(usb_dev.join("serial")).ok(),
                manufacturer: read_line(usb_dev.join("manufacturer")).ok(),
                product: read_line(usb_dev.join("product")).ok(),
                interface: read_line(usb_int.join("interface")).ok(),
            })
        }
        None => None,
    };

    Ok(Some(PortInfo {
        port: OsString::from(port),
        name: port.file_name().unwrap_or_default().to_owned(),
        usb_info,
    }))
}

pub fn list_all() -> Vec<PortInfo> {
    let mut ports = Vec::new();

    ports.extend(glob("/dev/ttyACM*")); // on-chip USB-CDC boot interface
    ports.extend(glob("/dev/ttyUSB*")); // usb-serial adapters
    ports.extend(glob("/dev/ttyXRUSB*")); // xr-usb-serial port exar
    ports.extend(glob("/dev/ttyS*")); // built-in serial ports
    ports.extend(glob("/dev/ttyAMA*")); // ARM internal port (raspi)
    ports.extend(glob("/dev/ttyAP*")); // Advantech multi-port controllers

    let mut available = Vec::new();
    for port in ports {
        if let Ok(ref port) = port {
            if let Ok(Some(info)) = port_info(port) {
                available.push(info);
            }
        }
    }

    available
}

/// Force the USB device behind a port to re-enumerate by toggling its
/// sysfs `authorized` attribute.
pub fn reset_usb(port: &Path) -> io::Result<()> {
    let usb_int = usb_interface_dir(port)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "port is not behind a USB device",
        )
    })?;
    let authorized = pathdir(usb_int).join("authorized");

    let mut file = File::create(&authorized)?;
    file.write_all(b"0")?;
    drop(file);

    let mut file = File::create(&authorized)?;
    file.write_all(b"1")?;

    Ok(())
}
