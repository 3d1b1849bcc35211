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

//! Security subcommands: lifecycle management, TrustZone boundaries,
//! serial-programming parameter, factory initialize, OSIS probe and
//! wrapped keys.

use std::fs;

use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use serial::SystemPort;

use ra_dfu::{
    util::{self, OsisProbe},
    Boundary, Device, DlmState, KeySlot,
};

/// Parse an id code: 32 hex characters with optional `0x` prefix.
pub fn parse_id_code(s: &str) -> Result<[u8; 16]> {
    let s = s.trim();
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    let bytes = parse_hex(hex)?;
    if bytes.len() != 16 {
        bail!("Id code must be 32 hex characters, got {}", hex.len());
    }

    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes);
    Ok(id)
}

/// Parse a key specification: `file:<path>` for binary key material
/// or `hex:<hex-chars>`.
pub fn parse_key_spec(s: &str) -> Result<Vec<u8>> {
    if let Some(path) = s.strip_prefix("file:") {
        let data = fs::read(path).with_context(|| {
            format!("Couldn't read key file `{}`", path)
        })?;
        if data.is_empty() {
            bail!("Key file `{}` is empty", path);
        }
        Ok(data)
    } else if let Some(hex) = s.strip_prefix("hex:") {
        parse_hex(hex)
    } else {
        bail!(
            "Key must be given as `file:<path>` or `hex:<hex-chars>`"
        );
    }
}

fn parse_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.is_empty() || !hex.is_ascii() || hex.len() % 2 != 0 {
        bail!("Invalid hex string `{}`", hex);
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .with_context(|| format!("Invalid hex string `{}`", hex))
        })
        .collect()
}

fn key16(key: Vec<u8>) -> Result<[u8; 16]> {
    if key.len() != 16 {
        bail!("Expected 16 bytes of key material, got {}", key.len());
    }

    let mut out = [0u8; 16];
    out.copy_from_slice(&key);
    Ok(out)
}

fn require_dlm(device: &Device<SystemPort>) -> Result<()> {
    if !device.family().supports_dlm() {
        bail!(
            "DLM commands are not supported on the {} group",
            device.family()
        );
    }
    Ok(())
}

pub fn dlm(device: &mut Device<SystemPort>) -> Result<()> {
    require_dlm(device)?;

    println!("DLM state: {}", device.dlm_state()?);
    Ok(())
}

pub fn dlm_transit(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    require_dlm(device)?;

    let target: DlmState = matches
        .value_of("STATE")
        .unwrap()
        .parse()
        .map_err(anyhow::Error::msg)?;

    if target.is_terminal() {
        log::warn!(
            "{} permanently locks the boot interface; this cannot be \
             undone",
            target
        );
    }

    device.dlm_transit(target).context("Lifecycle transition failed")?;
    log::info!("Lifecycle transition to {} requested", target);

    Ok(())
}

pub fn dlm_auth(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    require_dlm(device)?;

    let target: DlmState = matches
        .value_of("STATE")
        .unwrap()
        .parse()
        .map_err(anyhow::Error::msg)?;
    let key = key16(parse_key_spec(matches.value_of("KEY").unwrap())?)?;

    device
        .dlm_transit_auth(target, &key)
        .context("Authenticated lifecycle transition failed")?;
    log::info!("Lifecycle transition to {} requested", target);

    Ok(())
}

fn require_boundary(device: &Device<SystemPort>) -> Result<()> {
    if !device.family().supports_boundary() {
        bail!(
            "Boundary commands are not supported on the {} group",
            device.family()
        );
    }
    Ok(())
}

pub fn boundary(device: &mut Device<SystemPort>) -> Result<()> {
    require_boundary(device)?;

    let boundary = device.boundary()?;
    println!("CFS1: {:>5} KB (secure code flash)", boundary.cfs1);
    println!("CFS2: {:>5} KB (secure + NSC code flash)", boundary.cfs2);
    println!("DFS:  {:>5} KB (secure data flash)", boundary.dfs);
    println!("SRS1: {:>5} KB (secure SRAM)", boundary.srs1);
    println!("SRS2: {:>5} KB (secure + NSC SRAM)", boundary.srs2);

    Ok(())
}

pub fn boundary_set(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    require_boundary(device)?;

    let field = |name: &str| -> Result<u16> {
        matches
            .value_of(name)
            .unwrap()
            .parse()
            .with_context(|| format!("Invalid --{} value", name))
    };

    let boundary = Boundary {
        cfs1: field("cfs1")?,
        cfs2: field("cfs2")?,
        dfs: field("dfs")?,
        srs1: field("srs1")?,
        srs2: field("srs2")?,
    };

    device
        .set_boundary(&boundary)
        .context("Boundary setting failed")?;
    log::info!("Boundary settings programmed");

    Ok(())
}

pub fn param(device: &mut Device<SystemPort>) -> Result<()> {
    let enabled = device.serial_programming()?;
    println!(
        "Serial programming: {}",
        if enabled { "enabled" } else { "disabled" }
    );

    Ok(())
}

pub fn param_set(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    let enable = match matches.value_of("MODE").unwrap() {
        "enable" => true,
        "disable" => false,
        _ => unreachable!(),
    };

    if !enable {
        log::warn!(
            "Disabling serial programming locks this tool out after \
             the next reset"
        );
    }

    device
        .set_serial_programming(enable)
        .context("Parameter setting failed")?;
    log::info!(
        "Serial programming {}",
        if enable { "enabled" } else { "disabled" }
    );

    Ok(())
}

pub fn init(device: &mut Device<SystemPort>) -> Result<()> {
    log::warn!("Initializing erases all user areas and protection settings");

    device.initialize().context("Initialize failed")?;
    log::info!("Device initialized");

    Ok(())
}

pub fn osis(device: &mut Device<SystemPort>) -> Result<()> {
    let status = util::read_osis(device)?;

    match (status.probe, status.words) {
        (OsisProbe::DirectRead, Some(words)) => {
            print!("OSIS words:    ");
            for byte in &words {
                print!("{:02X}", byte);
            }
            println!();
            println!("Probe:         direct configuration-area read");
        }
        _ => {
            println!("Probe:         inferred from authentication");
        }
    }
    println!(
        "Id protection: {}",
        if status.locked { "in force" } else { "not set" }
    );

    Ok(())
}

fn require_keys(device: &Device<SystemPort>) -> Result<()> {
    if !device.family().supports_key_injection() {
        bail!(
            "Key commands are not supported on the {} group",
            device.family()
        );
    }
    Ok(())
}

fn key_slot(matches: &ArgMatches<'_>) -> Result<KeySlot> {
    matches
        .value_of("TYPE")
        .unwrap()
        .parse()
        .map_err(anyhow::Error::msg)
}

pub fn key_set(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    require_keys(device)?;

    let slot = key_slot(matches)?;
    let key = parse_key_spec(matches.value_of("KEY").unwrap())?;

    device.set_key(slot, &key).context("Key injection failed")?;
    log::info!("Key injected into the {} slot", slot);

    Ok(())
}

pub fn key_verify(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    require_keys(device)?;

    let slot = key_slot(matches)?;
    device.verify_key(slot).context("Key verification failed")?;
    log::info!("Key in the {} slot verified", slot);

    Ok(())
}

pub fn ukey_set(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    require_keys(device)?;

    let index: u8 = matches
        .value_of("INDEX")
        .unwrap()
        .parse()
        .context("Invalid user key index")?;
    let key = parse_key_spec(matches.value_of("KEY").unwrap())?;

    device
        .set_user_key(index, &key)
        .context("User key injection failed")?;
    log::info!("Key injected into user slot #{}", index);

    Ok(())
}

pub fn ukey_verify(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    require_keys(device)?;

    let index: u8 = matches
        .value_of("INDEX")
        .unwrap()
        .parse()
        .context("Invalid user key index")?;

    device
        .verify_user_key(index)
        .context("User key verification failed")?;
    log::info!("Key in user slot #{} verified", index);

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_id_code() {
        let id =
            parse_id_code("0x000102030405060708090A0B0C0D0E0F").unwrap();
        assert_eq!(id[0], 0x00);
        assert_eq!(id[15], 0x0F);

        let id =
            parse_id_code("ffffffffffffffffffffffffffffffff").unwrap();
        assert_eq!(id, [0xFF; 16]);

        assert!(parse_id_code("0xFFFF").is_err());
        assert!(parse_id_code("zz0102030405060708090A0B0C0D0E0F").is_err());
    }

    #[test]
    fn test_parse_key_spec() {
        let key = parse_key_spec("hex:DEADBEEF").unwrap();
        assert_eq!(key, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        assert!(parse_key_spec("hex:").is_err());
        assert!(parse_key_spec("hex:123").is_err());
        assert!(parse_key_spec("raw:00").is_err());
        assert!(parse_key_spec("file:/nonexistent/key.bin").is_err());
    }

    #[test]
    fn test_key16() {
        assert!(key16(vec![0u8; 16]).is_ok());
        assert!(key16(vec![0u8; 15]).is_err());
        assert!(key16(vec![0u8; 32]).is_err());
    }
}
