//! Boundcheck Runtime Library
//!
//! Runtime support for programs instrumented with bounds checks. Every live
//! allocation is registered as a region in a three-level [`RegionTable`];
//! instrumented pointer arithmetic goes through [`BoundChecker::checked_advance`]
//! and every load or store through [`BoundChecker::load`] /
//! [`BoundChecker::store`], which resolve the pointer to its region in near
//! constant time.
//!
//! Out-of-bounds arithmetic is not an error by itself: it yields
//! [`Pointer::Invalid`]. Dereferencing such a pointer, or any address outside
//! its region, is a [`Violation`].
//!
//! # Examples
//! ```
//! use boundcheck::{Access, BoundChecker, Config, Pointer};
//!
//! let mut checker = BoundChecker::new(Config::default()).unwrap();
//! let buf = Pointer::Valid(checker.allocate(16).unwrap());
//!
//! checker.store(buf, 15, Access::U8, 7);
//! assert_eq!(checker.load(buf, 15, Access::U8), 7);
//! assert!(checker.try_load(buf, 16, Access::U8).is_err());
//! assert_eq!(checker.checked_advance(buf, 17), Pointer::Invalid);
//! ```

pub mod check;
pub mod checker;
pub mod config;
pub mod global;
pub mod memory;
pub mod table;
pub mod trace;

mod region;
mod violation;

/// An address in the checked 32-bit address space.
pub type Addr = u32;

pub use check::{Access, INVALID_POINTER, Pointer, Scalar, Signedness, Width};
pub use checker::BoundChecker;
pub use config::{Config, FatalAction, UntrackedPolicy};
pub use memory::{ArenaHeap, MemoryAccessError, MemorySegment, RawAllocator, Zone};
pub use table::entry::Bounds;
pub use table::{RegionTable, Resolution, TableStats};
pub use violation::Violation;
