//! The region table.
//!
//! A 32-bit address is split into three fields, from most to least significant:
//!
//! ```text
//!  31          19 18          8 7        0
//! +--------------+-------------+----------+
//! |  directory   |    page     |  offset  |
//! |  (T1 bits)   |  (T2 bits)  | (T3 bits)|
//! +--------------+-------------+----------+
//! ```
//!
//! The directory and page fields together select the head [`CheckingEntry`] of
//! a block of `2^T3` addresses. Every region is copied into the head (or the
//! collision chain) of each block it touches, so resolving an address to its
//! region is a direct index followed, at worst, by a short chain walk.
//!
//! Directory slots that hold no region alias one of two shared sentinel pages
//! (all EMPTY or all INVALID) until the first write promotes them to a private
//! page. Private pages are never freed.

pub mod entry;
pub mod page;

use crate::Addr;
use crate::check::INVALID_POINTER;
use crate::memory::Zone;
use crate::violation::Violation;
use entry::{Bounds, CheckingEntry, NodeArena};
use page::{Page, PageId, PageRef};
use smallvec::SmallVec;
use std::fmt::Write;
use tracing::{debug, info, trace};

pub const T1_BITS: u32 = 13;
pub const T2_BITS: u32 = 11;
pub const T3_BITS: u32 = Addr::BITS - T1_BITS - T2_BITS;

pub const T1_SIZE: usize = 1 << T1_BITS;
pub const T2_SIZE: usize = 1 << T2_BITS;
/// Number of addresses covered by one checking entry.
pub const BLOCK_SIZE: u32 = 1 << T3_BITS;

pub const T23_BITS: u32 = T2_BITS + T3_BITS;
/// Number of addresses covered by one directory slot.
pub const T23_SIZE: u64 = 1 << T23_BITS;

/// Directory slot holding [`INVALID_POINTER`]. Always INVALID.
pub const INVALID_POINTER_ZONE: Zone = Zone::new(
    INVALID_POINTER & !((T23_SIZE - 1) as Addr),
    T23_SIZE as u32,
);

/// Total number of blocks in the address space.
const BLOCK_COUNT: u64 = 1 << (T1_BITS + T2_BITS);

/// Position of a block's head entry in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub dir: usize,
    pub index: usize,
}

impl Slot {
    #[inline]
    pub const fn of(addr: Addr) -> Self {
        Self {
            dir: (addr >> T23_BITS) as usize,
            index: (addr >> T3_BITS) as usize & (T2_SIZE - 1),
        }
    }

    /// Block number across the whole address space.
    pub const fn block(self) -> usize {
        (self.dir << T2_BITS) | self.index
    }

    pub const fn from_block(block: usize) -> Self {
        Self {
            dir: block >> T2_BITS,
            index: block & (T2_SIZE - 1),
        }
    }

    /// First address of the block.
    pub const fn base(self) -> Addr {
        (self.block() as Addr) << T3_BITS
    }
}

/// How the table classifies an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The address belongs to a live region.
    Region(Bounds),
    /// No region matches and the block is merely untracked.
    Untracked,
    /// No region matches and the block is explicitly forbidden.
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStats {
    /// Directory slots that own a private page.
    pub private_pages: usize,
    /// Chain nodes linked behind some head entry.
    pub live_nodes: usize,
    /// Chain nodes waiting on the free list.
    pub free_nodes: usize,
}

/// Address-to-region database.
///
/// Owns the directory, both sentinel pages, every private page and every chain
/// node. Nothing outside this type mutates checking entries.
#[derive(Debug)]
pub struct RegionTable {
    directory: Box<[PageRef]>,
    pages: Vec<Page>,
    empty_page: Page,
    invalid_page: Page,
    pub(crate) nodes: NodeArena,
}

impl RegionTable {
    /// Builds the table and marks the zone holding [`INVALID_POINTER`] as
    /// invalid, followed by every zone in `reserved`.
    ///
    /// Only fully covered blocks of a reserved zone are marked.
    pub fn bootstrap(reserved: &[Zone]) -> Result<Self, Violation> {
        let mut directory = Vec::new();
        directory
            .try_reserve_exact(T1_SIZE)
            .map_err(|_| Violation::MetadataExhausted)?;
        directory.resize(T1_SIZE, PageRef::Empty);

        let mut table = Self {
            directory: directory.into_boxed_slice(),
            pages: Vec::new(),
            empty_page: Page::filled(CheckingEntry::EMPTY)?,
            invalid_page: Page::filled(CheckingEntry::INVALID)?,
            nodes: NodeArena::default(),
        };

        table.mark_invalid(INVALID_POINTER_ZONE)?;
        for zone in reserved {
            table.mark_invalid(*zone)?;
        }

        info!(
            reserved = reserved.len(),
            private_pages = table.pages.len(),
            "region table initialized"
        );
        Ok(table)
    }

    fn page(&self, page: PageRef) -> &Page {
        match page {
            PageRef::Empty => &self.empty_page,
            PageRef::Invalid => &self.invalid_page,
            PageRef::Private(id) => &self.pages[id.index()],
        }
    }

    pub(crate) fn page_ref(&self, dir: usize) -> PageRef {
        self.directory[dir]
    }

    pub(crate) fn private_page_mut(&mut self, id: PageId) -> &mut Page {
        &mut self.pages[id.index()]
    }

    /// Head entry of the block containing `slot`.
    #[inline]
    pub fn head(&self, slot: Slot) -> &CheckingEntry {
        self.page(self.directory[slot.dir]).entry(slot.index)
    }

    /// Resolves `addr` to the bounds that govern it.
    ///
    /// Checks the block's head entry first and only walks the collision chain
    /// when the head describes a different region.
    #[inline]
    pub fn lookup(&mut self, addr: Addr) -> Bounds {
        let slot = Slot::of(addr);
        let bounds = self.head(slot).bounds;
        if bounds.contains(addr) {
            bounds
        } else {
            self.find_region(slot, addr)
        }
    }

    /// Walks the collision chain of `slot` looking for a region containing
    /// `addr`.
    ///
    /// A match found behind the head is swapped into the head entry, so the
    /// next lookup of the same region hits without walking. The swap only
    /// reorders the chain; its set of regions is unchanged. When nothing
    /// matches, the block's disposition (EMPTY or INVALID) is returned.
    pub fn find_region(&mut self, slot: Slot, addr: Addr) -> Bounds {
        let page = self.directory[slot.dir];
        let head = match page {
            PageRef::Private(id) => self.pages[id.index()].entry_mut(slot.index),
            shared => {
                // Sentinel pages never hold chains.
                let entry = self.page(shared).entry(slot.index);
                return if entry.bounds.contains(addr) {
                    entry.bounds
                } else {
                    entry.disposition()
                };
            }
        };

        if head.bounds.contains(addr) {
            return head.bounds;
        }

        let mut cursor = head.next;
        while let Some(id) = cursor {
            let node = self.nodes.get_mut(id);
            if node.bounds.contains(addr) {
                trace!(
                    addr = format_args!("0x{addr:08x}"),
                    start = format_args!("0x{:08x}", node.bounds.start),
                    "moving region to chain head"
                );
                std::mem::swap(&mut node.bounds, &mut head.bounds);
                return head.bounds;
            }
            cursor = node.next;
        }

        head.disposition()
    }

    /// Classifies `addr` without applying any untracked-access policy.
    pub fn classify(&mut self, addr: Addr) -> Resolution {
        let bounds = self.lookup(addr);
        if bounds == Bounds::EMPTY {
            Resolution::Untracked
        } else if bounds.is_sentinel() {
            Resolution::Forbidden
        } else {
            Resolution::Region(bounds)
        }
    }

    /// Returns the private page of directory slot `dir`, promoting the slot
    /// from its sentinel page if needed.
    ///
    /// A promoted page starts as a copy of the sentinel it replaces, so a slot
    /// that aliased the invalid page stays invalid where no region is written.
    pub(crate) fn materialize(&mut self, dir: usize) -> Result<PageId, Violation> {
        let template = match self.directory[dir] {
            PageRef::Private(id) => return Ok(id),
            PageRef::Empty => CheckingEntry::EMPTY,
            PageRef::Invalid => CheckingEntry::INVALID,
        };

        self.pages
            .try_reserve(1)
            .map_err(|_| Violation::MetadataExhausted)?;
        let id = PageId::new(self.pages.len())?;
        self.pages.push(Page::filled(template)?);
        debug!(
            dir,
            invalid = template.is_invalid,
            "promoted directory slot to a private page"
        );
        self.directory[dir] = PageRef::Private(id);
        Ok(id)
    }

    /// Applies `apply` to every head entry of the blocks strictly between
    /// `first` and `last`.
    ///
    /// With `promote` set, sentinel slots are given private pages first;
    /// otherwise they are skipped since they cannot hold any region.
    pub(crate) fn for_each_spanned(
        &mut self,
        first: Slot,
        last: Slot,
        promote: bool,
        mut apply: impl FnMut(&mut CheckingEntry),
    ) -> Result<(), Violation> {
        let stop = last.block();
        let mut block = first.block() + 1;
        while block < stop {
            let slot = Slot::from_block(block);
            let span = (T2_SIZE - slot.index).min(stop - block);
            let page = self.directory[slot.dir];
            let id = match page {
                PageRef::Private(id) => Some(id),
                _ if promote => Some(self.materialize(slot.dir)?),
                _ => None,
            };
            if let Some(id) = id {
                let entries = self.pages[id.index()].entries_mut();
                entries[slot.index..slot.index + span]
                    .iter_mut()
                    .for_each(&mut apply);
            }
            block += span;
        }
        Ok(())
    }

    /// Marks every block fully covered by `zone` as INVALID.
    ///
    /// Whole directory slots are pointed at the shared invalid page. Only meant
    /// for bootstrap: regions already registered in the zone are dropped.
    fn mark_invalid(&mut self, zone: Zone) -> Result<(), Violation> {
        let start = u64::from(zone.start);
        let end = start + u64::from(zone.size);
        let first = start.div_ceil(u64::from(BLOCK_SIZE));
        let last = (end >> T3_BITS).min(BLOCK_COUNT);
        debug!(
            start = format_args!("0x{:08x}", zone.start),
            size = zone.size,
            first,
            last,
            "marking zone invalid"
        );

        let mut block = first;
        while block < last {
            let slot = Slot::from_block(block as usize);
            let whole_page = slot.index == 0 && block + T2_SIZE as u64 <= last;
            if whole_page && !matches!(self.directory[slot.dir], PageRef::Private(_)) {
                self.directory[slot.dir] = PageRef::Invalid;
                block += T2_SIZE as u64;
            } else {
                let id = self.materialize(slot.dir)?;
                *self.pages[id.index()].entry_mut(slot.index) = CheckingEntry::INVALID;
                block += 1;
            }
        }
        Ok(())
    }

    /// Regions registered in the block containing `addr`, head first.
    pub fn chain(&self, addr: Addr) -> SmallVec<[Bounds; 4]> {
        let head = self.head(Slot::of(addr));
        let mut chain = SmallVec::new();
        if !head.bounds.is_sentinel() {
            chain.push(head.bounds);
        }
        let mut cursor = head.next;
        while let Some(id) = cursor {
            let node = self.nodes.get(id);
            chain.push(node.bounds);
            cursor = node.next;
        }
        chain
    }

    /// Renders every block that holds at least one region, one line per block:
    /// `block: start:end start:end ...`.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (dir, page) in self.directory.iter().enumerate() {
            let PageRef::Private(id) = page else {
                continue;
            };
            for (index, entry) in self.pages[id.index()].entries().iter().enumerate() {
                if entry.bounds.is_sentinel() {
                    continue;
                }
                let slot = Slot { dir, index };
                let _ = write!(out, "{:08x}:", slot.base());
                for bounds in self.chain(slot.base()) {
                    let _ = write!(out, " {:08x}:{:08x}", bounds.start, bounds.end());
                }
                out.push('\n');
            }
        }
        out
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            private_pages: self.pages.len(),
            live_nodes: self.nodes.live(),
            free_nodes: self.nodes.free(),
        }
    }
}
