//! Fatal bounds-checking errors.

use crate::Addr;
use std::fmt;

/// A condition the checker cannot continue from.
///
/// Table and check operations return these through `Result` so callers can
/// decide how to report them; the [`crate::BoundChecker`] fatal entry points
/// hand them to the configured [`crate::FatalAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// An access outside every registered region, or crossing a region's end.
    InvalidDeref { addr: Addr, offset: i32, width: u32 },
    /// Deleting an address that is not the start of a live region.
    InvalidDelete { addr: Addr },
    /// Reallocating an address that is not the start of a live region.
    InvalidRealloc { addr: Addr },
    /// The bounds check passed but no memory backs the address.
    Unmapped { addr: Addr, len: u32 },
    /// The table could not grow its own bookkeeping.
    MetadataExhausted,
    /// A region whose end does not fit in the address space.
    RegionOverflow { start: Addr, size: u32 },
    /// A region starting at address 0.
    NullRegion,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::InvalidDeref {
                addr,
                offset,
                width,
            } => write!(
                f,
                "dereferencing invalid pointer 0x{addr:08x} (offset {offset}, {width} bytes)"
            ),
            Violation::InvalidDelete { addr } => {
                write!(f, "deleting invalid region 0x{addr:08x}")
            }
            Violation::InvalidRealloc { addr } => {
                write!(f, "realloc'ing invalid pointer 0x{addr:08x}")
            }
            Violation::Unmapped { addr, len } => {
                write!(f, "access to unmapped memory at 0x{addr:08x} ({len} bytes)")
            }
            Violation::MetadataExhausted => {
                write!(f, "not enough memory for bound checking code")
            }
            Violation::RegionOverflow { start, size } => write!(
                f,
                "region 0x{start:08x} of {size} bytes wraps around the address space"
            ),
            Violation::NullRegion => write!(f, "cannot register a region at address 0"),
        }
    }
}

impl std::error::Error for Violation {}
