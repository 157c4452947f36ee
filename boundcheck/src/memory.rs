//! Memory the checked program runs on.
//!
//! The checker only owns bounds metadata. Bytes are owned by a segment that
//! implements [`MemorySegment`], and allocations come from a [`RawAllocator`].

pub mod arena;

use crate::Addr;
use anyhow::{Context, Result, bail};
use std::fmt;
use std::str::FromStr;

pub use arena::ArenaHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccessError {
    /// The address is not backed by this segment.
    NotFound,
    /// The access starts inside the segment but runs past its end.
    OutOfBounds,
}

impl fmt::Display for MemoryAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryAccessError::NotFound => write!(f, "address not mapped"),
            MemoryAccessError::OutOfBounds => write!(f, "access runs past the end of the segment"),
        }
    }
}

impl std::error::Error for MemoryAccessError {}

/// Raw byte access. No bounds checking beyond what the segment itself maps.
pub trait MemorySegment {
    fn read_addr(&self, address: Addr, size: u32) -> Result<&[u8], MemoryAccessError>;

    fn write_addr(&mut self, address: Addr, data: &[u8]) -> Result<(), MemoryAccessError>;

    /// Copies `len` bytes from `from` to `to`. The ranges may overlap.
    fn copy_within(&mut self, from: Addr, to: Addr, len: u32) -> Result<(), MemoryAccessError> {
        let bytes = self.read_addr(from, len)?.to_vec();
        self.write_addr(to, &bytes)
    }
}

/// The allocator whose allocations the checker brackets with region
/// registration and deletion.
pub trait RawAllocator: MemorySegment {
    /// Reserves at least `size + 1` bytes so that consecutive allocations are
    /// separated by a guard byte. Returns `None` when out of memory.
    fn raw_allocate(&mut self, size: u32) -> Option<Addr>;

    fn raw_deallocate(&mut self, address: Addr);

    /// Address range this allocator hands out memory from.
    fn zone(&self) -> Zone;
}

/// A contiguous address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    pub start: Addr,
    pub size: u32,
}

impl Zone {
    pub const fn new(start: Addr, size: u32) -> Self {
        Self { start, size }
    }

    /// End of the zone, exclusive. May be `2^32`.
    pub const fn end(&self) -> u64 {
        self.start as u64 + self.size as u64
    }

    /// Whether `[addr, addr + len)` lies inside the zone.
    pub const fn contains_range(&self, addr: Addr, len: u32) -> bool {
        addr >= self.start && addr as u64 + len as u64 <= self.end()
    }

    pub const fn overlaps(&self, other: &Zone) -> bool {
        (self.start as u64) < other.end() && (other.start as u64) < self.end()
    }

    /// Smallest zone made of whole `align`-byte units that covers this one.
    pub fn round_out(&self, align: u32) -> Zone {
        let align = u64::from(align);
        let start = u64::from(self.start) / align * align;
        let end = (self.end().div_ceil(align) * align).min(1 << Addr::BITS);
        Zone::new(start as Addr, u32::try_from(end - start).unwrap_or(u32::MAX))
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}:0x{:x}", self.start, self.size)
    }
}

impl FromStr for Zone {
    type Err = anyhow::Error;

    /// Parses `ADDR:SIZE`, each either decimal or `0x` hexadecimal.
    fn from_str(s: &str) -> Result<Self> {
        let Some((start, size)) = s.split_once(':') else {
            bail!("expected ADDR:SIZE, found `{s}`");
        };
        let start = parse_addr(start).with_context(|| format!("invalid zone start in `{s}`"))?;
        let size = parse_addr(size).with_context(|| format!("invalid zone size in `{s}`"))?;
        Ok(Zone::new(start, size))
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal 32-bit number.
pub fn parse_addr(text: &str) -> Result<Addr> {
    let text = text.trim();
    let parsed = match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => Addr::from_str_radix(&hex.replace('_', ""), 16),
        None => text.replace('_', "").parse(),
    };
    parsed.with_context(|| format!("`{text}` is not a 32-bit number"))
}
