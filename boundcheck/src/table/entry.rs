//! Checking entries and the arena that stores collision-chain nodes.
//!
//! Every block of the address space has exactly one head entry living inside a
//! page. When more than one region touches the same block, the extra regions
//! are kept in chain nodes allocated from a [`NodeArena`] and linked by index.

use crate::Addr;
use crate::violation::Violation;

/// Size stored in an entry that describes no region: every address matches it.
pub const EMPTY_SIZE: u32 = 0xffff_ffff;
/// Size stored in an entry whose addresses must never be accessed.
pub const INVALID_SIZE: u32 = 0;

/// The `(start, size)` pair describing one region.
///
/// An address `a` belongs to the region when `a - start <= size`, computed in
/// wrapping `u32` arithmetic. Addresses below `start` wrap around to values
/// larger than any real size, so a single unsigned comparison rejects both
/// addresses before the region and addresses past its end. The bound is
/// inclusive: `start + size` (one past the last byte) still resolves to the
/// region, which keeps one-past-end pointers usable for arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub start: Addr,
    pub size: u32,
}

impl Bounds {
    /// Untracked memory. Start 0 and maximal size match any address.
    pub const EMPTY: Bounds = Bounds {
        start: 0,
        size: EMPTY_SIZE,
    };

    /// Forbidden memory. Nothing can be accessed through it.
    pub const INVALID: Bounds = Bounds {
        start: 0,
        size: INVALID_SIZE,
    };

    pub const fn new(start: Addr, size: u32) -> Self {
        Self { start, size }
    }

    /// Offset of `addr` relative to the region start.
    ///
    /// The subtraction wraps on purpose; see the type level documentation.
    #[inline]
    pub const fn offset_of(&self, addr: Addr) -> u32 {
        addr.wrapping_sub(self.start)
    }

    #[inline]
    pub const fn contains(&self, addr: Addr) -> bool {
        self.offset_of(addr) <= self.size
    }

    /// Whether this is one of the two sentinel states rather than a region.
    ///
    /// Regions can never start at address 0, so a zero start is reserved for
    /// the EMPTY and INVALID states.
    #[inline]
    pub const fn is_sentinel(&self) -> bool {
        self.start == 0
    }

    /// Address one past the last byte of the region.
    pub const fn end(&self) -> Addr {
        self.start.wrapping_add(self.size)
    }
}

/// Index of a chain node inside the [`NodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Head entry of a block. One per block, stored inline in its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckingEntry {
    pub bounds: Bounds,
    /// Next region sharing this block, if any.
    pub next: Option<NodeId>,
    /// Whether a miss in this block resolves to INVALID rather than EMPTY.
    pub is_invalid: bool,
}

impl CheckingEntry {
    pub const EMPTY: CheckingEntry = CheckingEntry {
        bounds: Bounds::EMPTY,
        next: None,
        is_invalid: false,
    };

    pub const INVALID: CheckingEntry = CheckingEntry {
        bounds: Bounds::INVALID,
        next: None,
        is_invalid: true,
    };

    /// Sentinel bounds this block falls back to when no region matches.
    #[inline]
    pub const fn disposition(&self) -> Bounds {
        if self.is_invalid {
            Bounds::INVALID
        } else {
            Bounds::EMPTY
        }
    }

    /// Makes this entry describe exactly one region.
    pub fn fill(&mut self, bounds: Bounds) {
        self.bounds = bounds;
        self.next = None;
    }

    /// Returns the entry to its sentinel state, keeping its disposition.
    pub fn reset(&mut self) {
        self.bounds = self.disposition();
        self.next = None;
    }
}

/// A region that shares its block with the head entry's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainNode {
    pub bounds: Bounds,
    pub next: Option<NodeId>,
}

/// Storage for chain nodes with an intrusive free list.
///
/// Released nodes are threaded through their own `next` field and handed out
/// again before the arena grows, so allocate/free churn does not grow memory.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<ChainNode>,
    free_head: Option<NodeId>,
    free_count: usize,
}

impl NodeArena {
    pub fn alloc(&mut self, node: ChainNode) -> Result<NodeId, Violation> {
        if let Some(id) = self.free_head {
            let slot = &mut self.nodes[id.index()];
            self.free_head = slot.next;
            *slot = node;
            self.free_count -= 1;
            return Ok(id);
        }

        let id = u32::try_from(self.nodes.len())
            .map(NodeId)
            .map_err(|_| Violation::MetadataExhausted)?;
        self.nodes
            .try_reserve(1)
            .map_err(|_| Violation::MetadataExhausted)?;
        self.nodes.push(node);
        Ok(id)
    }

    /// Returns the node's content and puts its slot on the free list.
    pub fn release(&mut self, id: NodeId) -> ChainNode {
        let slot = &mut self.nodes[id.index()];
        let node = *slot;
        *slot = ChainNode {
            bounds: Bounds::EMPTY,
            next: self.free_head,
        };
        self.free_head = Some(id);
        self.free_count += 1;
        node
    }

    pub fn get(&self, id: NodeId) -> &ChainNode {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut ChainNode {
        &mut self.nodes[id.index()]
    }

    /// Number of nodes currently linked into some chain.
    pub fn live(&self) -> usize {
        self.nodes.len() - self.free_count
    }

    pub fn free(&self) -> usize {
        self.free_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_wrapping_contains() {
        let bounds = Bounds::new(0x1000, 16);

        assert!(bounds.contains(0x1000));
        assert!(bounds.contains(0x100f));
        // One past the end still resolves to the region
        assert!(bounds.contains(0x1010));
        assert!(!bounds.contains(0x1011));
        // Below the start wraps to a huge offset
        assert!(!bounds.contains(0x0fff));
        assert_eq!(bounds.offset_of(0x0fff), u32::MAX);
    }

    #[test]
    fn test_sentinel_bounds() {
        assert!(Bounds::EMPTY.contains(0));
        assert!(Bounds::EMPTY.contains(u32::MAX));
        assert!(!Bounds::INVALID.contains(1));
        assert!(Bounds::EMPTY.is_sentinel());
        assert!(Bounds::INVALID.is_sentinel());
        assert!(!Bounds::new(0x10, 0).is_sentinel());
    }

    #[test]
    fn test_entry_reset_keeps_disposition() {
        let mut entry = CheckingEntry::INVALID;
        entry.fill(Bounds::new(0x2000, 8));
        assert_eq!(entry.bounds, Bounds::new(0x2000, 8));
        entry.reset();
        assert_eq!(entry, CheckingEntry::INVALID);

        let mut entry = CheckingEntry::EMPTY;
        entry.fill(Bounds::new(0x2000, 8));
        entry.reset();
        assert_eq!(entry, CheckingEntry::EMPTY);
    }

    #[test]
    fn test_arena_reuses_released_nodes() {
        let mut arena = NodeArena::default();
        let node = ChainNode {
            bounds: Bounds::new(0x3000, 4),
            next: None,
        };

        let a = arena.alloc(node).unwrap();
        let b = arena.alloc(node).unwrap();
        assert_eq!(arena.live(), 2);

        assert_eq!(arena.release(a), node);
        assert_eq!(arena.live(), 1);
        assert_eq!(arena.free(), 1);

        let c = arena.alloc(node).unwrap();
        assert_eq!(c, a);
        assert_ne!(c, b);
        assert_eq!(arena.free(), 0);
        assert_eq!(arena.live(), 2);
    }
}
