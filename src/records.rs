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

//! # Firmware image codecs
//!
//! Intel-HEX and Motorola S-record parsing and writing, plus raw
//! binary. Parsing materializes a contiguous image with its base
//! address; gaps between records are filled with `0xFF` (the erased
//! flash state).

use std::{fs, path::Path, str::FromStr};

use crate::Error;

/// Upper bound on the span a sparse record file may cover.
const MAX_IMAGE: u64 = 0x2000_0000;

/// Data bytes per emitted record line.
const LINE_BYTES: usize = 16;

/// Firmware file format.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Format {
    /// Pick by file extension, raw binary when unrecognized.
    Auto,
    Bin,
    Ihex,
    Srec,
}

impl Format {
    /// Format for a path, from its extension.
    pub fn detect(path: &Path) -> Format {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "hex" | "ihex" => Format::Ihex,
            "srec" | "s19" | "s28" | "s37" | "mot" => Format::Srec,
            _ => Format::Bin,
        }
    }

    fn resolve(self, path: &Path) -> Format {
        match self {
            Format::Auto => Format::detect(path),
            other => other,
        }
    }
}

#[derive(Debug)]
pub struct ParseFormatError;

impl std::fmt::Display for ParseFormatError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            fmt,
            "invalid value, format must be one of: `auto`, `bin`, \
             `ihex`, `srec`"
        )
    }
}

impl std::error::Error for ParseFormatError {}

impl FromStr for Format {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Format::Auto),
            "bin" => Ok(Format::Bin),
            "ihex" | "hex" => Ok(Format::Ihex),
            "srec" | "mot" => Ok(Format::Srec),
            _ => Err(ParseFormatError),
        }
    }
}

/// A firmware file materialized as one contiguous byte image.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    /// Lowest address observed in the file. Meaningful only when
    /// `has_address` is set; raw binaries carry no address.
    pub base: u32,
    pub has_address: bool,
    pub image: Vec<u8>,
}

impl ParsedFile {
    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }
}

/// Parse a firmware file.
pub fn parse(path: &Path, format: Format) -> Result<ParsedFile, Error> {
    match format.resolve(path) {
        Format::Bin => Ok(ParsedFile {
            base: 0,
            has_address: false,
            image: fs::read(path)?,
        }),
        Format::Ihex => parse_ihex(&fs::read_to_string(path)?),
        Format::Srec => parse_srec(&fs::read_to_string(path)?),
        Format::Auto => unreachable!(),
    }
}

/// Write a firmware image.
pub fn emit(
    path: &Path,
    format: Format,
    image: &[u8],
    base: u32,
) -> Result<(), Error> {
    match format.resolve(path) {
        Format::Bin => fs::write(path, image)?,
        Format::Ihex => fs::write(path, emit_ihex(image, base))?,
        Format::Srec => fs::write(path, emit_srec(image, base))?,
        Format::Auto => unreachable!(),
    }

    Ok(())
}

fn bad(lineno: usize, what: &str) -> Error {
    Error::BadInputFile(format!("line {}: {}", lineno + 1, what))
}

fn hex_bytes(s: &str, lineno: usize) -> Result<Vec<u8>, Error> {
    if !s.is_ascii() || s.len() % 2 != 0 {
        return Err(bad(lineno, "malformed hex record"));
    }

    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| bad(lineno, "invalid hex digit"))
        })
        .collect()
}

fn parse_ihex(text: &str) -> Result<ParsedFile, Error> {
    let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut base_offset: u32 = 0;
    let mut terminated = false;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with(':') {
            return Err(bad(lineno, "record does not start with ':'"));
        }

        let bytes = hex_bytes(&line[1..], lineno)?;
        if bytes.len() < 5 {
            return Err(bad(lineno, "record too short"));
        }

        let count = bytes[0] as usize;
        if bytes.len() != count + 5 {
            return Err(bad(lineno, "byte count does not match record"));
        }

        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(bad(lineno, "record checksum mismatch"));
        }

        let offset = u16::from_be_bytes([bytes[1], bytes[2]]);
        let rtype = bytes[3];
        let data = &bytes[4..4 + count];

        match rtype {
            0x00 => chunks.push((
                base_offset.wrapping_add(u32::from(offset)),
                data.to_vec(),
            )),
            0x01 => {
                terminated = true;
                break;
            }
            0x02 => {
                if count != 2 {
                    return Err(bad(lineno, "bad segment record length"));
                }
                base_offset =
                    u32::from(u16::from_be_bytes([data[0], data[1]])) << 4;
            }
            0x04 => {
                if count != 2 {
                    return Err(bad(lineno, "bad linear record length"));
                }
                base_offset =
                    u32::from(u16::from_be_bytes([data[0], data[1]])) << 16;
            }
            0x03 | 0x05 => {}
            _ => return Err(bad(lineno, "unknown record type")),
        }
    }

    if !terminated {
        return Err(Error::BadInputFile(
            "missing end-of-file record".to_string(),
        ));
    }

    assemble(chunks)
}

fn parse_srec(text: &str) -> Result<ParsedFile, Error> {
    let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut terminated = false;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if !line.is_ascii() || line.len() < 2 {
            return Err(bad(lineno, "malformed record"));
        }

        let mut heads = line.chars();
        if !matches!(heads.next(), Some('S') | Some('s')) {
            return Err(bad(lineno, "record does not start with 'S'"));
        }
        let rtype = heads.next().unwrap_or(' ');

        let bytes = hex_bytes(&line[2..], lineno)?;
        if bytes.is_empty() || bytes.len() != bytes[0] as usize + 1 {
            return Err(bad(lineno, "byte count does not match record"));
        }

        // Sum of count, address, data and checksum is 0xFF.
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0xFF {
            return Err(bad(lineno, "record checksum mismatch"));
        }

        let addr_len = match rtype {
            '0' | '1' | '5' | '9' => 2,
            '2' | '6' | '8' => 3,
            '3' | '7' => 4,
            _ => return Err(bad(lineno, "unknown record type")),
        };
        if bytes.len() < addr_len + 2 {
            return Err(bad(lineno, "record too short"));
        }

        match rtype {
            '1' | '2' | '3' => {
                let mut addr = 0u32;
                for byte in &bytes[1..1 + addr_len] {
                    addr = (addr << 8) | u32::from(*byte);
                }
                let data = &bytes[1 + addr_len..bytes.len() - 1];
                chunks.push((addr, data.to_vec()));
            }
            '7' | '8' | '9' => {
                terminated = true;
                break;
            }
            // S0 header and S5/S6 record counts.
            _ => {}
        }
    }

    if !terminated {
        return Err(Error::BadInputFile(
            "missing termination record".to_string(),
        ));
    }

    assemble(chunks)
}

fn assemble(chunks: Vec<(u32, Vec<u8>)>) -> Result<ParsedFile, Error> {
    let mut min = u64::MAX;
    let mut max_end = 0u64;

    for (addr, data) in &chunks {
        if data.is_empty() {
            continue;
        }
        let addr = u64::from(*addr);
        min = min.min(addr);
        max_end = max_end.max(addr + data.len() as u64);
    }

    if min == u64::MAX {
        return Err(Error::BadInputFile("no data records".to_string()));
    }
    if max_end - min > MAX_IMAGE {
        return Err(Error::BadInputFile(format!(
            "records span {:#X} bytes, refusing to materialize",
            max_end - min
        )));
    }

    let mut image = vec![0xFF; (max_end - min) as usize];
    for (addr, data) in &chunks {
        let off = (u64::from(*addr) - min) as usize;
        image[off..off + data.len()].copy_from_slice(data);
    }

    Ok(ParsedFile { base: min as u32, has_address: true, image })
}

fn ihex_record(offset: u16, rtype: u8, data: &[u8]) -> String {
    let mut sum = (data.len() as u8)
        .wrapping_add((offset >> 8) as u8)
        .wrapping_add(offset as u8)
        .wrapping_add(rtype);

    let mut line = format!(":{:02X}{:04X}{:02X}", data.len(), offset, rtype);
    for byte in data {
        sum = sum.wrapping_add(*byte);
        line.push_str(&format!("{:02X}", byte));
    }
    line.push_str(&format!("{:02X}\n", sum.wrapping_neg()));

    line
}

fn emit_ihex(image: &[u8], base: u32) -> String {
    let mut out = String::new();
    let mut high = 0u16;
    let mut off = 0usize;

    while off < image.len() {
        let addr = base.wrapping_add(off as u32);

        let addr_high = (addr >> 16) as u16;
        if addr_high != high {
            high = addr_high;
            out.push_str(&ihex_record(0, 0x04, &high.to_be_bytes()));
        }

        // Records never cross a 64 KiB boundary.
        let line = LINE_BYTES
            .min(0x1_0000 - (addr as usize & 0xFFFF))
            .min(image.len() - off);
        out.push_str(&ihex_record(
            addr as u16,
            0x00,
            &image[off..off + line],
        ));
        off += line;
    }

    out.push_str(&ihex_record(0, 0x01, &[]));
    out
}

fn srec_record(rtype: char, addr: u32, addr_len: usize, data: &[u8]) -> String {
    let count = (addr_len + data.len() + 1) as u8;
    let addr_bytes = &addr.to_be_bytes()[4 - addr_len..];

    let mut sum = count;
    let mut line = format!("S{}{:02X}", rtype, count);
    for byte in addr_bytes.iter().chain(data) {
        sum = sum.wrapping_add(*byte);
        line.push_str(&format!("{:02X}", byte));
    }
    line.push_str(&format!("{:02X}\n", 0xFFu8.wrapping_sub(sum)));

    line
}

fn emit_srec(image: &[u8], base: u32) -> String {
    let mut out = srec_record('0', 0, 2, b"ra-dfu");

    for (index, chunk) in image.chunks(LINE_BYTES).enumerate() {
        let addr = base.wrapping_add((index * LINE_BYTES) as u32);
        out.push_str(&srec_record('3', addr, 4, chunk));
    }

    out.push_str(&srec_record('7', base, 4, &[]));
    out
}
