//! First-fit allocator over a fixed 32-bit address range.
//!
//! Backs the heap of a checked program. Every block carries one trailing guard
//! byte, so two consecutive allocations never share their one-past-end address
//! with the next block's first byte.

use crate::Addr;
use crate::memory::{MemoryAccessError, MemorySegment, RawAllocator, Zone};
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Alignment of every address handed out by [`ArenaHeap`].
pub const HEAP_ALIGN: u32 = 8;

/// Heap living in the zone `[zone.start, zone.start + zone.size)`.
#[derive(Debug)]
pub struct ArenaHeap {
    zone: Zone,
    data: Vec<u8>,
    /// Free blocks, start to length. Adjacent blocks are always coalesced.
    free: BTreeMap<Addr, u32>,
    /// Live blocks, start to reserved length (guard byte included).
    live: BTreeMap<Addr, u32>,
}

impl ArenaHeap {
    /// Creates an empty heap over `zone`.
    ///
    /// Address 0 is never handed out: a zone starting at 0 loses its first
    /// aligned slot.
    pub fn new(zone: Zone) -> Self {
        let mut free = BTreeMap::new();
        let skip = if zone.start == 0 { HEAP_ALIGN } else { 0 };
        let first = align_up(u64::from(zone.start) + u64::from(skip));
        if first < zone.end() {
            free.insert(first as Addr, (zone.end() - first) as u32);
        }
        Self {
            zone,
            data: vec![0; zone.size as usize],
            free,
            live: BTreeMap::new(),
        }
    }

    /// Number of live allocations.
    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }

    /// Bytes not reserved by any live allocation.
    pub fn free_bytes(&self) -> u64 {
        self.free.values().map(|len| u64::from(*len)).sum()
    }

    /// Converts a checked range into an index range of `data`.
    fn range(&self, address: Addr, size: u32) -> Result<std::ops::Range<usize>, MemoryAccessError> {
        if address < self.zone.start || u64::from(address) >= self.zone.end() {
            return Err(MemoryAccessError::NotFound);
        }
        if !self.zone.contains_range(address, size) {
            return Err(MemoryAccessError::OutOfBounds);
        }
        let start = (address - self.zone.start) as usize;
        Ok(start..start + size as usize)
    }

    /// Returns a block to the free map, merging it with its neighbours.
    fn release(&mut self, mut start: Addr, mut len: u32) {
        let end = u64::from(start) + u64::from(len);
        if end < self.zone.end()
            && let Some(next_len) = self.free.remove(&(end as Addr))
        {
            len += next_len;
        }
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back()
            && u64::from(prev) + u64::from(prev_len) == u64::from(start)
        {
            start = prev;
            len += prev_len;
        }
        self.free.insert(start, len);
    }
}

/// Rounds `value` up to [`HEAP_ALIGN`].
fn align_up(value: u64) -> u64 {
    value.next_multiple_of(u64::from(HEAP_ALIGN))
}

impl MemorySegment for ArenaHeap {
    fn read_addr(&self, address: Addr, size: u32) -> Result<&[u8], MemoryAccessError> {
        let range = self.range(address, size)?;
        Ok(&self.data[range])
    }

    fn write_addr(&mut self, address: Addr, data: &[u8]) -> Result<(), MemoryAccessError> {
        let size = u32::try_from(data.len()).map_err(|_| MemoryAccessError::OutOfBounds)?;
        let range = self.range(address, size)?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn copy_within(&mut self, from: Addr, to: Addr, len: u32) -> Result<(), MemoryAccessError> {
        let src = self.range(from, len)?;
        let dst = self.range(to, len)?;
        self.data.copy_within(src, dst.start);
        Ok(())
    }
}

impl RawAllocator for ArenaHeap {
    /// Finds the first free block large enough for `size` bytes plus the
    /// guard byte, rounded up to [`HEAP_ALIGN`].
    fn raw_allocate(&mut self, size: u32) -> Option<Addr> {
        let needed = u32::try_from(align_up(u64::from(size) + 1)).ok()?;
        let (&start, &len) = self.free.iter().find(|&(_, &len)| len >= needed)?;

        self.free.remove(&start);
        if len > needed {
            self.free.insert(start + needed, len - needed);
        }
        self.live.insert(start, needed);
        trace!(
            addr = format_args!("0x{start:08x}"),
            size,
            reserved = needed,
            "heap allocation"
        );
        Some(start)
    }

    fn raw_deallocate(&mut self, address: Addr) {
        match self.live.remove(&address) {
            Some(len) => {
                trace!(addr = format_args!("0x{address:08x}"), len, "heap release");
                self.release(address, len);
            }
            None => warn!(
                addr = format_args!("0x{address:08x}"),
                "ignoring release of an address the heap never handed out"
            ),
        }
    }

    fn zone(&self) -> Zone {
        self.zone
    }
}
