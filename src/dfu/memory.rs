//! DfuSe memory layout descriptors
//!
//! A DfuSe interface names its flash region with a string such as
//! `@External Flash /0x90000000/08*004Kg,01*032Kg,31*064Kg`: the region name, then one or more
//! `/<start address>/<sector groups>` pairs. Each sector group is `<count>*<size><unit><type>`,
//! where the unit is one of ` `, `B`, `K` or `M`, and the type letter `a`-`g` encodes the
//! readable (bit 0), erasable (bit 1) and writable (bit 2) flags plus one.

use std::convert::TryFrom;

use crate::TransportError;

/// A run of equally sized sectors
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Segment {
    pub start: u32,
    pub end: u32,
    pub sector_size: u32,
    pub readable: bool,
    pub erasable: bool,
    pub writable: bool,
}

impl Segment {
    fn contains(&self, address: u32) -> bool {
        self.start <= address && address < self.end
    }

    /// Returns the start of the sector containing `address`
    pub fn sector_start(&self, address: u32) -> u32 {
        self.start + (address - self.start) / self.sector_size * self.sector_size
    }

    /// Returns the end of the sector containing `address`
    pub fn sector_end(&self, address: u32) -> u32 {
        self.sector_start(address) + self.sector_size
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemoryLayout {
    pub name: String,
    pub segments: Vec<Segment>,
}

impl MemoryLayout {
    pub fn parse(descriptor: &str) -> Result<MemoryLayout, TransportError> {
        let invalid = |reason| TransportError::InvalidDescriptor(descriptor.to_owned(), reason);

        let body = descriptor
            .trim()
            .strip_prefix('@')
            .ok_or_else(|| invalid("missing leading @"))?;
        let mut parts = body.split('/');
        let name = parts.next().unwrap_or_default().trim().to_owned();
        let mut segments = Vec::new();

        while let Some(address) = parts.next() {
            let address = address.trim();
            let mut start = address
                .strip_prefix("0x")
                .or_else(|| address.strip_prefix("0X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .ok_or_else(|| invalid("bad start address"))?;
            let groups = parts.next().ok_or_else(|| invalid("missing sector list"))?;

            for group in groups.split(',').map(str::trim).filter(|g| !g.is_empty()) {
                let (count, sector_size, flags) =
                    parse_sector_group(group).ok_or_else(|| invalid("bad sector group"))?;
                let end = count
                    .checked_mul(sector_size)
                    .and_then(|len| start.checked_add(len))
                    .ok_or_else(|| invalid("region overflows the address space"))?;

                segments.push(Segment {
                    start,
                    end,
                    sector_size,
                    readable: flags & 0b001 != 0,
                    erasable: flags & 0b010 != 0,
                    writable: flags & 0b100 != 0,
                });

                start = end;
            }
        }

        if segments.is_empty() {
            return Err(invalid("no segments"));
        }

        Ok(MemoryLayout { name, segments })
    }

    /// The address the region starts at
    pub fn start_address(&self) -> u32 {
        self.segments[0].start
    }

    pub fn segment(&self, address: u32) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(address))
    }

    /// Returns the `(address, size)` of every erasable sector overlapping `len` bytes at `start`
    pub fn erase_plan(&self, start: u32, len: usize) -> Result<Vec<(u32, u32)>, TransportError> {
        let mut sectors = Vec::new();

        if len == 0 {
            return Ok(sectors);
        }

        let last = u32::try_from(len - 1)
            .ok()
            .and_then(|offset| start.checked_add(offset))
            .ok_or(TransportError::OutOfRange(start))?;
        let end = self
            .segment(last)
            .ok_or(TransportError::OutOfRange(last))?
            .sector_end(last);
        let mut address = self
            .segment(start)
            .ok_or(TransportError::OutOfRange(start))?
            .sector_start(start);

        while address < end {
            let segment = self
                .segment(address)
                .ok_or(TransportError::OutOfRange(address))?;

            if !segment.erasable {
                address = segment.end;
                continue;
            }

            let sector = segment.sector_start(address);
            sectors.push((sector, segment.sector_size));
            address = sector + segment.sector_size;
        }

        Ok(sectors)
    }
}

/// Parses `<count>*<size><unit><type>` into the count, the sector size in bytes, and the flags
fn parse_sector_group(group: &str) -> Option<(u32, u32, u8)> {
    let (count, rest) = group.split_at(group.find('*')?);
    let count = count.trim().parse::<u32>().ok()?;
    let rest = rest[1..].trim_start();

    let digits = rest.find(|c: char| !c.is_ascii_digit())?;
    let size = rest[..digits].parse::<u32>().ok()?;
    let mut suffix = rest[digits..].chars().filter(|c| *c != ' ');

    let (multiplier, kind) = match (suffix.next()?, suffix.next()) {
        ('B', Some(kind)) => (1, kind),
        ('K', Some(kind)) => (1024, kind),
        ('M', Some(kind)) => (1024 * 1024, kind),
        (kind, None) => (1, kind),
        _ => return None,
    };

    if suffix.next().is_some() || !('a'..='g').contains(&kind) {
        return None;
    }

    Some((count, size.checked_mul(multiplier)?, kind as u8 - b'a' + 1))
}
