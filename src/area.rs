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

//! # Area map
//!
//! The boot firmware reports up to four memory areas, each with its
//! own alignment units for erase, write, read and CRC. All address
//! arithmetic against the device goes through this module.

use std::fmt::{self, Display, Formatter};

use crate::Error;

/// Number of area slots a device can report.
pub const AREA_SLOTS: usize = 4;

/// Byte length of one area-information reply payload.
pub const AREA_REPLY_LEN: usize = 25;

/// Bulk operation selecting which alignment unit applies.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Operation {
    Erase,
    Write,
    Read,
    Crc,
}

impl Display for Operation {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Operation::Erase => "erase",
            Operation::Write => "write",
            Operation::Read => "read",
            Operation::Crc => "crc",
        };
        write!(fmt, "{}", name)
    }
}

/// Kind of a memory area, from the high nibble of the KOA byte.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AreaType {
    Code,
    Data,
    Config,
}

impl Display for AreaType {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let name = match *self {
            AreaType::Code => "code",
            AreaType::Data => "data",
            AreaType::Config => "config",
        };
        write!(fmt, "{}", name)
    }
}

/// One memory area as reported by the area-information command.
#[derive(Debug, Clone, Copy)]
pub struct Area {
    /// Kind-of-area descriptor: high nibble type, low nibble index.
    pub koa: u8,
    /// Start address.
    pub start: u32,
    /// End address, inclusive.
    pub end: u32,
    /// Erase alignment unit; zero when erase is unsupported here.
    pub eau: u32,
    /// Write alignment unit; zero when write is unsupported here.
    pub wau: u32,
    /// Read alignment unit; zero when read is unsupported here.
    pub rau: u32,
    /// CRC alignment unit; zero when CRC is unsupported here.
    pub cau: u32,
}

impl Area {
    /// Decode a 25-byte area-information reply payload:
    /// KOA(1) SAD(4) EAD(4) EAU(4) WAU(4) RAU(4) CAU(4), big-endian.
    pub fn decode(payload: &[u8]) -> Result<Area, Error> {
        if payload.len() != AREA_REPLY_LEN {
            return Err(Error::Protocol(format!(
                "area reply is {} bytes, expected {}",
                payload.len(),
                AREA_REPLY_LEN
            )));
        }

        let be32 = |off: usize| {
            u32::from_be_bytes([
                payload[off],
                payload[off + 1],
                payload[off + 2],
                payload[off + 3],
            ])
        };

        let area = Area {
            koa: payload[0],
            start: be32(1),
            end: be32(5),
            eau: be32(9),
            wau: be32(13),
            rau: be32(17),
            cau: be32(21),
        };

        if area.start > area.end {
            return Err(Error::Protocol(format!(
                "area start {:#010X} past end {:#010X}",
                area.start, area.end
            )));
        }
        for &align in &[area.eau, area.wau, area.rau, area.cau] {
            if align != 0 && !align.is_power_of_two() {
                return Err(Error::Protocol(format!(
                    "area alignment {:#X} is not a power of two",
                    align
                )));
            }
        }

        Ok(area)
    }

    /// Area type from the KOA high nibble.
    pub fn area_type(&self) -> Option<AreaType> {
        match self.koa >> 4 {
            0 => Some(AreaType::Code),
            1 => Some(AreaType::Data),
            2 => Some(AreaType::Config),
            _ => None,
        }
    }

    /// Slot index from the KOA low nibble.
    #[inline]
    pub fn index(&self) -> u8 {
        self.koa & 0x0F
    }

    /// Alignment unit for an operation; zero means unsupported.
    #[inline]
    pub fn alignment(&self, op: Operation) -> u32 {
        match op {
            Operation::Erase => self.eau,
            Operation::Write => self.wau,
            Operation::Read => self.rau,
            Operation::Crc => self.cau,
        }
    }

    /// Whether the address falls inside this area.
    #[inline]
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr <= self.end
    }

    /// Byte length of the area.
    #[inline]
    pub fn len(&self) -> u64 {
        u64::from(self.end) - u64::from(self.start) + 1
    }
}

/// The per-session table of discovered areas.
#[derive(Debug, Default)]
pub struct AreaTable {
    areas: Vec<Area>,
}

impl AreaTable {
    pub fn new() -> AreaTable {
        AreaTable { areas: Vec::with_capacity(AREA_SLOTS) }
    }

    /// Add a discovered area, rejecting overlap with existing slots.
    pub fn push(&mut self, area: Area) -> Result<(), Error> {
        if self.areas.len() == AREA_SLOTS {
            return Err(Error::Protocol(
                "device reported more areas than slots".to_string(),
            ));
        }
        for existing in &self.areas {
            if area.start <= existing.end && existing.start <= area.end {
                return Err(Error::Protocol(format!(
                    "area {:#010X}..{:#010X} overlaps \
                     {:#010X}..{:#010X}",
                    area.start, area.end, existing.start, existing.end
                )));
            }
        }

        self.areas.push(area);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Area> {
        self.areas.iter()
    }

    /// The slot containing `addr`, if any.
    pub fn find(&self, addr: u32) -> Option<&Area> {
        self.areas.iter().find(|area| area.contains(addr))
    }

    /// Compute the device-facing `(start, end)` pair for a bulk
    /// operation.
    ///
    /// `start` must sit on the operation's alignment; `size` zero
    /// means "from start to the end of the area"; the computed end is
    /// `start + ceil(size / align) * align - 1` and must stay inside
    /// the containing area.
    pub fn bounds(
        &self,
        start: u32,
        size: u32,
        op: Operation,
    ) -> Result<(u32, u32), Error> {
        let area = self
            .find(start)
            .ok_or(Error::UnknownArea { addr: start })?;

        let align = area.alignment(op);
        if align == 0 {
            return Err(Error::Alignment { op, addr: start, align: 0 });
        }
        if start % align != 0 {
            return Err(Error::Alignment { op, addr: start, align });
        }

        let size = if size == 0 {
            u64::from(area.end) - u64::from(start) + 1
        } else {
            u64::from(size)
        };

        let align = u64::from(align);
        let units = (size + align - 1) / align;
        let end = u64::from(start) + units * align - 1;

        if end > u64::from(area.end) {
            return Err(Error::UnknownArea {
                addr: end.min(u64::from(u32::MAX)) as u32,
            });
        }

        Ok((start, end as u32))
    }
}
