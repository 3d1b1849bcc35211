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

//! Memory subcommands: info, read, write, verify, erase, blank-check
//! and CRC.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use indicatif::{ProgressBar, ProgressStyle};
use serial::SystemPort;

use ra_dfu::{
    records::{self, Format, ParsedFile},
    util, Device,
};

/// Parse a `0x`-prefixed hexadecimal or decimal number.
pub fn parse_num(s: &str) -> Result<u32> {
    let s = s.trim();

    if let Some(hex) =
        s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
    .with_context(|| format!("Invalid number `{}`", s))
}

fn progress_bar(action: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>8} [{bar:40}] {bytes}/{total_bytes}")
            .progress_chars("=> "),
    );
    bar.set_message(action);
    bar
}

fn tick(bar: &ProgressBar) -> impl FnMut(usize, usize) + '_ {
    move |done, total| {
        bar.set_length(total as u64);
        bar.set_position(done as u64);
    }
}

pub fn info(device: &mut Device<SystemPort>) -> Result<()> {
    let signature = device.signature().clone();

    println!("Product:       {}", signature.product);
    print!("Device id:     ");
    for byte in &signature.device_id {
        print!("{:02X}", byte);
    }
    println!();
    println!(
        "Device group:  {} ({})",
        device.family(),
        device.family().core_name()
    );
    println!("Boot firmware: {}", signature.version_string());
    println!("Max baud rate: {} bps", signature.max_baud);

    println!("Areas:");
    for area in device.areas().iter() {
        let kind = match area.area_type() {
            Some(kind) => kind.to_string(),
            None => format!("kind {:#04X}", area.koa),
        };
        println!(
            "  {:>6} #{}: {:#010X}..{:#010X} \
             (EAU {:#X}, WAU {:#X}, RAU {:#X}, CAU {:#X})",
            kind,
            area.index(),
            area.start,
            area.end,
            area.eau,
            area.wau,
            area.rau,
            area.cau
        );
    }

    if device.family().supports_dlm() {
        println!("DLM state:     {}", device.dlm_state()?);
    }
    if device.family().supports_boundary() {
        match device.boundary() {
            Ok(boundary) => println!(
                "Boundary:      CFS1 {} KB, CFS2 {} KB, DFS {} KB, \
                 SRS1 {} KB, SRS2 {} KB",
                boundary.cfs1,
                boundary.cfs2,
                boundary.dfs,
                boundary.srs1,
                boundary.srs2
            ),
            // Some lifecycle states refuse the query; not fatal.
            Err(e) => log::debug!("boundary request refused: {}", e),
        }
    }

    Ok(())
}

pub fn read(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    let path = Path::new(matches.value_of("FILE").unwrap());
    let address = parse_num(matches.value_of("address").unwrap())?;
    let size = parse_num(matches.value_of("size").unwrap())?;

    let bar = progress_bar("reading");
    let image = util::read_range(device, address, size, tick(&bar))?;
    bar.finish();

    records::emit(path, Format::Auto, &image, address)
        .with_context(|| {
            format!("Couldn't write output file `{}`", path.display())
        })?;
    log::info!("{} bytes read to `{}`", image.len(), path.display());

    Ok(())
}

fn load(
    matches: &ArgMatches<'_>,
) -> Result<(ParsedFile, u32)> {
    let path = Path::new(matches.value_of("FILE").unwrap());
    let format: Format = matches
        .value_of("input-format")
        .unwrap()
        .parse()
        .map_err(anyhow::Error::msg)?;

    let parsed = records::parse(path, format).with_context(|| {
        format!("Couldn't parse firmware file `{}`", path.display())
    })?;
    if parsed.is_empty() {
        bail!("Firmware file `{}` is empty", path.display());
    }

    // An explicit --address beats the address carried by the file.
    let address = if matches.occurrences_of("address") > 0
        || !parsed.has_address
    {
        parse_num(matches.value_of("address").unwrap())?
    } else {
        parsed.base
    };

    log::info!(
        "Firmware file: `{}`, {} bytes at {:#010X}",
        path.display(),
        parsed.len(),
        address
    );

    Ok((parsed, address))
}

pub fn write(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    let (parsed, address) = load(matches)?;

    if matches.is_present("erase") {
        let bar = progress_bar("erasing");
        util::erase_range(
            device,
            address,
            parsed.len() as u32,
            tick(&bar),
        )?;
        bar.finish();
    }

    let bar = progress_bar("writing");
    util::write_range(device, address, &parsed.image, tick(&bar))?;
    bar.finish();

    if matches.is_present("verify") {
        check(device, address, &parsed.image)?;
    }

    log::info!("Write finished");

    Ok(())
}

pub fn verify(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    let (parsed, address) = load(matches)?;
    check(device, address, &parsed.image)
}

fn check(
    device: &mut Device<SystemPort>,
    address: u32,
    image: &[u8],
) -> Result<()> {
    let bar = progress_bar("verifying");
    let mismatch =
        util::verify_range(device, address, image, tick(&bar))?;
    bar.finish();

    match mismatch {
        None => {
            log::info!("Verification passed, {} bytes", image.len());
            Ok(())
        }
        Some((addr, expected, found)) => bail!(
            "Verification failed at {:#010X}: expected {:#04X}, \
             found {:#04X}",
            addr,
            expected,
            found
        ),
    }
}

pub fn erase(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    let address = parse_num(matches.value_of("address").unwrap())?;
    let size = parse_num(matches.value_of("size").unwrap())?;

    let bar = progress_bar("erasing");
    util::erase_range(device, address, size, tick(&bar))?;
    bar.finish();

    log::info!("Erase finished");

    Ok(())
}

pub fn blank_check(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    let address = parse_num(matches.value_of("address").unwrap())?;
    let size = parse_num(matches.value_of("size").unwrap())?;

    let bar = progress_bar("checking");
    let first = util::blank_check(device, address, size, tick(&bar))?;
    bar.finish();

    match first {
        None => {
            log::info!("Range is blank");
            Ok(())
        }
        Some(addr) => {
            bail!("Range is not blank, first programmed byte at {:#010X}",
                  addr)
        }
    }
}

pub fn crc(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    let address = parse_num(matches.value_of("address").unwrap())?;
    let size = parse_num(matches.value_of("size").unwrap())?;

    let crc = util::crc_range(device, address, size)?;
    println!("CRC-32: {:#010X}", crc);

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_num() {
        assert_eq!(parse_num("0").unwrap(), 0);
        assert_eq!(parse_num("4096").unwrap(), 4096);
        assert_eq!(parse_num("0x2000").unwrap(), 0x2000);
        assert_eq!(parse_num("0XFFFF0000").unwrap(), 0xFFFF_0000);
        assert_eq!(parse_num(" 0x10 ").unwrap(), 0x10);
        assert!(parse_num("12g").is_err());
        assert!(parse_num("0x").is_err());
    }
}
