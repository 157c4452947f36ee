//! Region registration and deletion.
//!
//! A region `(start, size)` is written into every block from the block of
//! `start` through the block of `start + size`. The two edge blocks may be
//! shared with other regions, so the region is pushed onto their collision
//! chains. Blocks strictly in between belong to this region alone and are
//! overwritten directly.

use crate::Addr;
use crate::table::entry::{Bounds, ChainNode};
use crate::table::page::PageRef;
use crate::table::{RegionTable, Slot};
use crate::violation::Violation;
use tracing::debug;

impl RegionTable {
    /// Registers the region `[start, start + size)`.
    ///
    /// The caller guarantees the region does not overlap any live region,
    /// including the one-past-end address of either.
    pub fn new_region(&mut self, start: Addr, size: u32) -> Result<(), Violation> {
        if start == 0 {
            return Err(Violation::NullRegion);
        }
        let end = start
            .checked_add(size)
            .ok_or(Violation::RegionOverflow { start, size })?;
        let bounds = Bounds::new(start, size);
        let first = Slot::of(start);
        let last = Slot::of(end);
        debug!(
            start = format_args!("0x{start:08x}"),
            size,
            blocks = last.block() - first.block() + 1,
            "new region"
        );

        self.add_region(first, bounds)?;
        if first != last {
            let spanned = self
                .for_each_spanned(first, last, true, |entry| entry.fill(bounds))
                .and_then(|()| self.add_region(last, bounds));
            if let Err(violation) = spanned {
                // Leave no half-registered region behind.
                self.unlink(first, last, start)?;
                return Err(violation);
            }
        }
        Ok(())
    }

    /// Inserts `bounds` at the head of the block's collision chain.
    fn add_region(&mut self, slot: Slot, bounds: Bounds) -> Result<(), Violation> {
        let id = self.materialize(slot.dir)?;
        let head = *self.private_page_mut(id).entry(slot.index);
        if head.bounds.is_sentinel() {
            self.private_page_mut(id).entry_mut(slot.index).bounds = bounds;
            return Ok(());
        }

        let node = self.nodes.alloc(ChainNode {
            bounds: head.bounds,
            next: head.next,
        })?;
        let head = self.private_page_mut(id).entry_mut(slot.index);
        head.bounds = bounds;
        head.next = Some(node);
        Ok(())
    }

    /// Removes the region starting exactly at `start`.
    ///
    /// Each touched block falls back to its own disposition once its last
    /// region is gone, so a region freed inside a reserved zone leaves the
    /// zone INVALID.
    pub fn delete_region(&mut self, start: Addr) -> Result<(), Violation> {
        let found = self.lookup(start);
        if found.is_sentinel() || found.start != start {
            return Err(Violation::InvalidDelete { addr: start });
        }
        let first = Slot::of(start);
        let last = Slot::of(found.end());
        debug!(
            start = format_args!("0x{start:08x}"),
            size = found.size,
            "delete region"
        );

        self.unlink(first, last, start)
    }

    /// Drops the region starting at `start` from every block it was written
    /// to, from `first` through `last`.
    fn unlink(&mut self, first: Slot, last: Slot, start: Addr) -> Result<(), Violation> {
        self.remove_region(first, start);
        if first != last {
            // Never promotes, so this cannot allocate.
            self.for_each_spanned(first, last, false, |entry| entry.reset())?;
            self.remove_region(last, start);
        }
        Ok(())
    }

    /// Unlinks the region starting at `start` from the block's chain.
    ///
    /// The head entry itself is never released: when the region sits in the
    /// head, the next chain node is pulled into it, or the head is reset when
    /// the chain is otherwise empty.
    fn remove_region(&mut self, slot: Slot, start: Addr) {
        let PageRef::Private(id) = self.page_ref(slot.dir) else {
            return;
        };
        let head = *self.private_page_mut(id).entry(slot.index);

        if head.bounds.start == start && !head.bounds.is_sentinel() {
            let entry = match head.next {
                None => {
                    let mut entry = head;
                    entry.reset();
                    entry
                }
                Some(next) => {
                    let node = self.nodes.release(next);
                    let mut entry = head;
                    entry.bounds = node.bounds;
                    entry.next = node.next;
                    entry
                }
            };
            *self.private_page_mut(id).entry_mut(slot.index) = entry;
            return;
        }

        let mut prev = None;
        let mut cursor = head.next;
        while let Some(current) = cursor {
            let node = *self.nodes.get(current);
            if node.bounds.start == start {
                match prev {
                    None => self.private_page_mut(id).entry_mut(slot.index).next = node.next,
                    Some(prev) => self.nodes.get_mut(prev).next = node.next,
                }
                self.nodes.release(current);
                return;
            }
            prev = Some(current);
            cursor = node.next;
        }
    }

    /// Size of the live region starting exactly at `addr`.
    pub fn region_size(&mut self, addr: Addr) -> Option<u32> {
        let bounds = self.lookup(addr);
        (!bounds.is_sentinel() && bounds.start == addr).then_some(bounds.size)
    }
}

#[cfg(test)]
mod tests {
    use crate::memory::Zone;
    use crate::table::entry::Bounds;
    use crate::table::{BLOCK_SIZE, RegionTable, Resolution, Slot, T23_SIZE};
    use crate::violation::Violation;

    const HEAP: Zone = Zone::new(0x1000_0000, 0x10_0000);

    #[test]
    fn test_small_region() {
        let mut table = RegionTable::bootstrap(&[]).unwrap();
        table.new_region(0x0040_0010, 16).unwrap();

        let region = Resolution::Region(Bounds::new(0x0040_0010, 16));
        assert_eq!(table.classify(0x0040_0010), region);
        assert_eq!(table.classify(0x0040_0020), region);
        assert_eq!(table.classify(0x0040_0021), Resolution::Untracked);
        assert_eq!(table.region_size(0x0040_0010), Some(16));
        assert_eq!(table.region_size(0x0040_0011), None);
    }

    #[test]
    fn test_region_crossing_directory_slots() {
        let mut table = RegionTable::bootstrap(&[]).unwrap();
        // Starts near the end of one directory slot and runs through two more
        let start = 0x0047_ff00;
        let size = 0x0010_0000;
        table.new_region(start, size).unwrap();

        let region = Resolution::Region(Bounds::new(start, size));
        for addr in [start, 0x0048_0000, 0x004c_0000, 0x0050_0000, start + size] {
            assert_eq!(table.classify(addr), region, "at 0x{addr:08x}");
        }
        assert_eq!(table.classify(start - 1), Resolution::Untracked);
        assert_eq!(table.classify(start + size + 1), Resolution::Untracked);
        assert_eq!(table.stats().private_pages, 3);

        table.delete_region(start).unwrap();
        for addr in [start, 0x0048_0000, 0x004c_0000, start + size] {
            assert_eq!(table.classify(addr), Resolution::Untracked);
        }
        assert!(table.dump().is_empty());
    }

    #[test]
    fn test_block_aligned_region_stops_after_end_block() {
        let mut table = RegionTable::bootstrap(&[]).unwrap();
        let start = 0x0040_0000;
        let size = 4 * BLOCK_SIZE;
        table.new_region(start, size).unwrap();

        // The one-past-end address opens the next block, which holds the region
        assert_eq!(table.chain(start + size).len(), 1);
        // The block after that is untouched
        assert!(table.chain(start + size + BLOCK_SIZE).is_empty());
    }

    #[test]
    fn test_shared_edge_blocks() {
        let mut table = RegionTable::bootstrap(&[]).unwrap();
        let a = Bounds::new(0x0040_0010, 0x100);
        let b = Bounds::new(0x0040_0120, 0x100);
        table.new_region(a.start, a.size).unwrap();
        table.new_region(b.start, b.size).unwrap();

        // Block 0x400100 holds the end of `a` and the start of `b`
        assert_eq!(table.chain(0x0040_0100).as_slice(), &[b, a]);
        assert_eq!(table.stats().live_nodes, 1);

        table.delete_region(a.start).unwrap();
        assert_eq!(table.chain(0x0040_0100).as_slice(), &[b]);
        assert_eq!(table.classify(0x0040_0120), Resolution::Region(b));
        assert_eq!(table.classify(0x0040_0010), Resolution::Untracked);
        assert_eq!(table.stats().live_nodes, 0);
        assert_eq!(table.stats().free_nodes, 1);
    }

    #[test]
    fn test_delete_from_middle_of_chain() {
        let mut table = RegionTable::bootstrap(&[]).unwrap();
        let regions = [
            Bounds::new(0x0040_0000, 8),
            Bounds::new(0x0040_0010, 8),
            Bounds::new(0x0040_0020, 8),
        ];
        for bounds in regions {
            table.new_region(bounds.start, bounds.size).unwrap();
        }
        assert_eq!(
            table.chain(0x0040_0000).as_slice(),
            &[regions[2], regions[1], regions[0]]
        );

        table.delete_region(regions[1].start).unwrap();
        assert_eq!(
            table.chain(0x0040_0000).as_slice(),
            &[regions[2], regions[0]]
        );
        assert_eq!(table.classify(0x0040_0000), Resolution::Region(regions[0]));
        assert_eq!(table.classify(0x0040_0014), Resolution::Untracked);
    }

    #[test]
    fn test_delete_restores_invalid_zone() {
        let mut table = RegionTable::bootstrap(&[HEAP]).unwrap();
        let start = 0x1000_0010;
        let size = T23_SIZE as u32;
        table.new_region(start, size).unwrap();
        assert_eq!(
            table.classify(start + 0x1000),
            Resolution::Region(Bounds::new(start, size))
        );

        table.delete_region(start).unwrap();
        for addr in [start, start + 0x1000, start + size] {
            assert_eq!(table.classify(addr), Resolution::Forbidden);
        }
    }

    #[test]
    fn test_invalid_deletes() {
        let mut table = RegionTable::bootstrap(&[]).unwrap();
        table.new_region(0x0040_0010, 16).unwrap();

        assert_eq!(
            table.delete_region(0x0040_0014),
            Err(Violation::InvalidDelete { addr: 0x0040_0014 })
        );
        assert_eq!(
            table.delete_region(0x0050_0000),
            Err(Violation::InvalidDelete { addr: 0x0050_0000 })
        );

        table.delete_region(0x0040_0010).unwrap();
        // Double free
        assert_eq!(
            table.delete_region(0x0040_0010),
            Err(Violation::InvalidDelete { addr: 0x0040_0010 })
        );
    }

    #[test]
    fn test_rejected_regions() {
        let mut table = RegionTable::bootstrap(&[]).unwrap();
        assert_eq!(table.new_region(0, 4), Err(Violation::NullRegion));
        assert_eq!(
            table.new_region(0xffff_fff0, 0x20),
            Err(Violation::RegionOverflow {
                start: 0xffff_fff0,
                size: 0x20
            })
        );
    }

    #[test]
    fn test_unlink_discards_partial_registration() {
        let mut table = RegionTable::bootstrap(&[]).unwrap();
        // Shares the first block of the partial region below
        let neighbour = Bounds::new(0x0040_0000, 8);
        table.new_region(neighbour.start, neighbour.size).unwrap();
        let baseline = table.dump();
        let stats = table.stats();

        // State left when promoting a spanned slot fails: first block linked,
        // spanned blocks partly filled, last block untouched.
        let bounds = Bounds::new(0x0040_0010, 0x0010_0000);
        let first = Slot::of(bounds.start);
        let last = Slot::of(bounds.end());
        table.add_region(first, bounds).unwrap();
        let mid = Slot::of(0x0044_0000);
        table
            .for_each_spanned(first, mid, true, |entry| entry.fill(bounds))
            .unwrap();
        assert_eq!(table.classify(0x0042_0000), Resolution::Region(bounds));

        table.unlink(first, last, bounds.start).unwrap();
        assert_eq!(table.dump(), baseline);
        assert_eq!(table.stats().live_nodes, stats.live_nodes);
        assert_eq!(table.chain(neighbour.start).as_slice(), &[neighbour]);
        assert_eq!(table.classify(0x0042_0000), Resolution::Untracked);
        assert_eq!(
            table.delete_region(bounds.start),
            Err(Violation::InvalidDelete { addr: bounds.start })
        );
    }

    #[test]
    fn test_reregistration_after_delete_reuses_nodes() {
        let mut table = RegionTable::bootstrap(&[]).unwrap();
        table.new_region(0x0040_0000, 8).unwrap();
        table.new_region(0x0040_0010, 8).unwrap();
        table.delete_region(0x0040_0010).unwrap();
        table.delete_region(0x0040_0000).unwrap();
        assert_eq!(table.stats().live_nodes, 0);

        table.new_region(0x0040_0000, 8).unwrap();
        table.new_region(0x0040_0010, 8).unwrap();
        let stats = table.stats();
        assert_eq!(stats.live_nodes, 1);
        assert_eq!(stats.free_nodes, 0);
    }
}
