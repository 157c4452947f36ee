//! Second level of the region table.

use super::T2_SIZE;
use super::entry::CheckingEntry;
use crate::violation::Violation;

/// Index of a private page owned by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageId(u32);

impl PageId {
    pub(super) fn new(index: usize) -> Result<Self, Violation> {
        u32::try_from(index)
            .map(PageId)
            .map_err(|_| Violation::MetadataExhausted)
    }

    pub(super) fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a directory slot points at.
///
/// Slots start out aliasing one of the two shared sentinel pages and are
/// promoted to a private page the first time a region needs to be written
/// into them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRef {
    Empty,
    Invalid,
    Private(PageId),
}

/// `T2_SIZE` checking entries, one per block.
#[derive(Debug)]
pub struct Page {
    entries: Box<[CheckingEntry]>,
}

impl Page {
    /// Creates a page where every entry is a copy of `template`.
    pub fn filled(template: CheckingEntry) -> Result<Self, Violation> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(T2_SIZE)
            .map_err(|_| Violation::MetadataExhausted)?;
        entries.resize(T2_SIZE, template);
        Ok(Self {
            entries: entries.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn entry(&self, index: usize) -> &CheckingEntry {
        &self.entries[index]
    }

    #[inline]
    pub fn entry_mut(&mut self, index: usize) -> &mut CheckingEntry {
        &mut self.entries[index]
    }

    pub fn entries(&self) -> &[CheckingEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [CheckingEntry] {
        &mut self.entries
    }
}
