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

//! # Bulk flows
//!
//! Area-aware wrappers around the chunk-level device primitives:
//! streamed read and write, paced erase, CRC, blank check and
//! verify. Every function validates addresses against the area
//! table before anything reaches the wire and reports progress in
//! bytes through a caller-supplied callback.

use crate::{
    area::Operation,
    constants::{CHUNK_SIZE, OSIS_ADDR},
    Device, Error,
};

/// Erased-flash fill byte.
const BLANK: u8 = 0xFF;

/// Read a range into a contiguous buffer.
///
/// `size` of zero reads from `start` to the end of the containing
/// area.
pub fn read_range<P, F>(
    device: &mut Device<P>,
    start: u32,
    size: u32,
    mut progress: F,
) -> Result<Vec<u8>, Error>
where
    P: serial::SerialPort,
    F: FnMut(usize, usize),
{
    let (start, end) =
        device.areas().bounds(start, size, Operation::Read)?;
    let total = (u64::from(end) - u64::from(start) + 1) as usize;

    log::info!(
        "reading {} bytes from {:#010X} ({} chunks)",
        total,
        start,
        (total + CHUNK_SIZE - 1) / CHUNK_SIZE
    );

    device.read_request(start, end)?;

    let mut image = Vec::with_capacity(total);
    while image.len() < total {
        let chunk = device.read_chunk()?;
        if chunk.is_empty() {
            return Err(Error::Protocol(
                "empty chunk inside a read flow".to_string(),
            ));
        }
        image.extend_from_slice(&chunk);
        progress(image.len().min(total), total);
    }
    image.truncate(total);

    Ok(image)
}

/// Write an image at `start`.
///
/// The image is padded with `0xFF` up to the write alignment unit;
/// each wire chunk carries exactly 1024 payload bytes, the final one
/// zero-padded by the chunk primitive.
pub fn write_range<P, F>(
    device: &mut Device<P>,
    start: u32,
    data: &[u8],
    mut progress: F,
) -> Result<(), Error>
where
    P: serial::SerialPort,
    F: FnMut(usize, usize),
{
    if data.is_empty() {
        return Ok(());
    }

    let (start, end) =
        device.areas().bounds(start, data.len() as u32, Operation::Write)?;
    let total = (u64::from(end) - u64::from(start) + 1) as usize;

    let mut image = Vec::with_capacity(total);
    image.extend_from_slice(data);
    image.resize(total, BLANK);

    log::info!(
        "writing {} bytes at {:#010X} ({} chunks)",
        total,
        start,
        (total + CHUNK_SIZE - 1) / CHUNK_SIZE
    );

    device.write_request(start, end)?;

    let mut written = 0;
    for chunk in image.chunks(CHUNK_SIZE) {
        device.write_chunk(chunk)?;
        written += chunk.len();
        progress(written, total);
    }

    Ok(())
}

/// Erase a range, one erase-unit block per command so every wait
/// stays bounded by the long command timeout.
///
/// `size` of zero erases from `start` to the end of the containing
/// area.
pub fn erase_range<P, F>(
    device: &mut Device<P>,
    start: u32,
    size: u32,
    mut progress: F,
) -> Result<(), Error>
where
    P: serial::SerialPort,
    F: FnMut(usize, usize),
{
    let (start, end) =
        device.areas().bounds(start, size, Operation::Erase)?;
    let eau = device
        .areas()
        .find(start)
        .map(|area| area.eau)
        .unwrap_or(0);
    debug_assert!(eau > 0);

    let total = (u64::from(end) - u64::from(start) + 1) as usize;
    let blocks = total / eau as usize;

    for block in 0..blocks {
        let block_start = start + block as u32 * eau;
        log::info!("erasing block #{} at {:#010X}", block, block_start);

        device.erase(block_start, block_start + (eau - 1))?;
        progress((block + 1) * eau as usize, total);
    }

    Ok(())
}

/// Device-side CRC-32 (IEEE 802.3) of a range.
pub fn crc_range<P>(
    device: &mut Device<P>,
    start: u32,
    size: u32,
) -> Result<u32, Error>
where
    P: serial::SerialPort,
{
    let (start, end) = device.areas().bounds(start, size, Operation::Crc)?;
    device.crc(start, end)
}

/// Check that a range is erased. Returns the address of the first
/// programmed byte, or `None` when the whole range is blank.
pub fn blank_check<P, F>(
    device: &mut Device<P>,
    start: u32,
    size: u32,
    progress: F,
) -> Result<Option<u32>, Error>
where
    P: serial::SerialPort,
    F: FnMut(usize, usize),
{
    let image = read_range(device, start, size, progress)?;

    Ok(image
        .iter()
        .position(|&byte| byte != BLANK)
        .map(|off| start + off as u32))
}

/// Compare device contents against an image. Returns the first
/// mismatch as `(address, expected, found)`, or `None` on a match.
pub fn verify_range<P, F>(
    device: &mut Device<P>,
    start: u32,
    data: &[u8],
    progress: F,
) -> Result<Option<(u32, u8, u8)>, Error>
where
    P: serial::SerialPort,
    F: FnMut(usize, usize),
{
    let image = read_range(device, start, data.len() as u32, progress)?;

    for (off, (expected, found)) in
        data.iter().zip(image.iter()).enumerate()
    {
        if expected != found {
            return Ok(Some((start + off as u32, *expected, *found)));
        }
    }

    Ok(None)
}

/// Which probe produced an [`OsisStatus`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OsisProbe {
    /// The OSIS words were read out of the configuration area.
    DirectRead,
    /// Lock state inferred from whether the session authenticated.
    Inferred,
}

/// Serial-programmer id-protection status.
#[derive(Debug, Clone)]
pub struct OsisStatus {
    pub probe: OsisProbe,
    /// Raw OSIS words, present for the direct-read probe.
    pub words: Option<[u8; 16]>,
    /// Whether an id code is in force.
    pub locked: bool,
}

/// Probe the OSIS id-protection setting.
///
/// Device generations whose area table covers the OSIS address get a
/// direct word read; on the rest the lock state is inferred from
/// whether this session had to authenticate. The returned status
/// reports which probe ran.
pub fn read_osis<P>(device: &mut Device<P>) -> Result<OsisStatus, Error>
where
    P: serial::SerialPort,
{
    if device.areas().find(OSIS_ADDR).is_some() {
        let image = read_range(device, OSIS_ADDR, 16, |_, _| {})?;
        let mut words = [0u8; 16];
        words.copy_from_slice(&image[..16]);

        // All-ones is the unprogrammed (unlocked) state.
        let locked = words.iter().any(|&byte| byte != BLANK);

        return Ok(OsisStatus {
            probe: OsisProbe::DirectRead,
            words: Some(words),
            locked,
        });
    }

    Ok(OsisStatus {
        probe: OsisProbe::Inferred,
        words: None,
        locked: device.is_authenticated(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::*;
    use crate::packet;
    use crate::test::{mock_device, reply};

    // The mock device of `crate::test`: code area 0..0x3FFFF with
    // EAU 0x2000 / WAU 0x80, data area 0x0800_0000..0x0800_1FFF with
    // EAU 0x40 / WAU 4 / CAU 4.

    #[test]
    fn test_read_range() {
        let mut device = mock_device(false);

        let chunk0: Vec<u8> = (0..CHUNK_SIZE).map(|i| i as u8).collect();
        let chunk1 = vec![0x42u8; 476];
        device.port_script(&reply(CMD_READ, &chunk0));
        device.port_script(&reply(CMD_READ, &chunk1));
        device.port_take_tx();

        let mut seen = Vec::new();
        let image = read_range(&mut device, 0, 1500, |done, total| {
            seen.push((done, total));
        })
        .unwrap();

        assert_eq!(image.len(), 1500);
        assert_eq!(&image[..CHUNK_SIZE], chunk0.as_slice());
        assert!(image[CHUNK_SIZE..].iter().all(|&b| b == 0x42));
        assert_eq!(seen, vec![(1024, 1500), (1500, 1500)]);

        // Request frame plus one ack per received chunk.
        let mut expected = Vec::new();
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&1499u32.to_be_bytes());
        expected.extend(packet::pack(CMD_READ, &payload, false).unwrap());
        expected.extend(packet::pack(CMD_READ, &[0x00], true).unwrap());
        expected.extend(packet::pack(CMD_READ, &[0x00], true).unwrap());
        assert_eq!(device.port_take_tx(), expected);
    }

    #[test]
    fn test_write_range() {
        let mut device = mock_device(false);

        device.port_script(&reply(CMD_WRITE, &[0x00])); // range accepted
        device.port_script(&reply(CMD_WRITE, &[0x00])); // chunk ack
        device.port_take_tx();

        let data = vec![0xABu8; 130];
        let mut last = (0, 0);
        write_range(&mut device, 0, &data, |done, total| {
            last = (done, total);
        })
        .unwrap();

        // 130 bytes round up to 256 against the 0x80 write unit.
        assert_eq!(last, (256, 256));

        let mut expected = Vec::new();
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&255u32.to_be_bytes());
        expected
            .extend(packet::pack(CMD_WRITE, &payload, false).unwrap());

        // One wire chunk: data, alignment fill, zero padding.
        let mut chunk = vec![0xABu8; 130];
        chunk.resize(256, 0xFF);
        chunk.resize(CHUNK_SIZE, 0x00);
        expected.extend(packet::pack(CMD_WRITE, &chunk, true).unwrap());
        assert_eq!(device.port_take_tx(), expected);
    }

    #[test]
    fn test_write_range_rejects_misaligned() {
        let mut device = mock_device(false);
        device.port_take_tx();

        let data = [0u8; 16];
        assert!(matches!(
            write_range(&mut device, 0x81, &data, |_, _| {}),
            Err(Error::Alignment { align: 0x80, .. })
        ));
        // Nothing reached the wire.
        assert!(device.port_take_tx().is_empty());
    }

    #[test]
    fn test_erase_range() {
        let mut device = mock_device(false);

        device.port_script(&reply(CMD_ERASE, &[0x00]));
        device.port_script(&reply(CMD_ERASE, &[0x00]));
        device.port_take_tx();

        let mut blocks = 0;
        erase_range(&mut device, 0, 0x4000, |_, _| blocks += 1).unwrap();
        assert_eq!(blocks, 2);

        // Two erase commands, one per 0x2000 block.
        let mut expected = Vec::new();
        for block in 0u32..2 {
            let mut payload = Vec::new();
            payload.extend_from_slice(&(block * 0x2000).to_be_bytes());
            payload.extend_from_slice(
                &(block * 0x2000 + 0x1FFF).to_be_bytes(),
            );
            expected
                .extend(packet::pack(CMD_ERASE, &payload, false).unwrap());
        }
        assert_eq!(device.port_take_tx(), expected);
    }

    #[test]
    fn test_crc_range_rounds_to_alignment() {
        let mut device = mock_device(false);

        device
            .port_script(&reply(CMD_CRC, &0x1234_5678u32.to_be_bytes()));
        device.port_take_tx();

        // 6 bytes round up to 8 against the data area's CAU of 4.
        assert_eq!(
            crc_range(&mut device, 0x0800_0000, 6).unwrap(),
            0x1234_5678
        );

        let mut payload = Vec::new();
        payload.extend_from_slice(&0x0800_0000u32.to_be_bytes());
        payload.extend_from_slice(&0x0800_0007u32.to_be_bytes());
        assert_eq!(
            device.port_take_tx(),
            packet::pack(CMD_CRC, &payload, false).unwrap()
        );
    }

    #[test]
    fn test_blank_check() {
        let mut device = mock_device(false);

        device.port_script(&reply(CMD_READ, &[0xFF; 64]));
        assert_eq!(
            blank_check(&mut device, 0, 64, |_, _| {}).unwrap(),
            None
        );

        let mut dirty = [0xFFu8; 64];
        dirty[5] = 0x00;
        device.port_script(&reply(CMD_READ, &dirty));
        assert_eq!(
            blank_check(&mut device, 0x100, 64, |_, _| {}).unwrap(),
            Some(0x105)
        );
    }

    #[test]
    fn test_verify_range() {
        let mut device = mock_device(false);

        let image = vec![0x5Au8; 32];
        device.port_script(&reply(CMD_READ, &image));
        assert_eq!(
            verify_range(&mut device, 0, &image, |_, _| {}).unwrap(),
            None
        );

        let mut corrupted = image.clone();
        corrupted[7] = 0xA5;
        device.port_script(&reply(CMD_READ, &corrupted));
        assert_eq!(
            verify_range(&mut device, 0, &image, |_, _| {}).unwrap(),
            Some((7, 0x5A, 0xA5))
        );
    }

    #[test]
    fn test_read_osis_inferred() {
        // The mock area table does not cover the OSIS address, so the
        // probe falls back to inference from the session state.
        let mut device = mock_device(false);

        let status = read_osis(&mut device).unwrap();
        assert_eq!(status.probe, OsisProbe::Inferred);
        assert_eq!(status.words, None);
        assert!(!status.locked);

        device.port_script(&reply(CMD_ID_AUTH, &[0x00]));
        device.authenticate(&[0x11; 16]).unwrap();

        let status = read_osis(&mut device).unwrap();
        assert_eq!(status.probe, OsisProbe::Inferred);
        assert!(status.locked);
    }
}
