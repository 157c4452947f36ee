//! Hot-path bounds checks for pointer arithmetic and dereferences.

use crate::Addr;
use crate::config::UntrackedPolicy;
use crate::table::RegionTable;
use crate::table::entry::Bounds;
use crate::violation::Violation;
use anyhow::bail;
use num_traits::AsPrimitive;
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;
use tracing::trace;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Raw value used for out-of-bounds pointers when they have to be handed to
/// code that only understands plain addresses. Its directory slot is marked
/// invalid at bootstrap, so dereferencing it always fails.
pub const INVALID_POINTER: Addr = 0xffff_fffe;

/// Result of bounds-checked pointer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pointer {
    Valid(Addr),
    /// Arithmetic left the bounds of the pointer's region. Further arithmetic
    /// keeps it invalid and dereferencing it is fatal.
    Invalid,
}

impl Pointer {
    /// Interprets a raw address, mapping [`INVALID_POINTER`] back to `Invalid`.
    pub const fn from_raw(addr: Addr) -> Self {
        if addr == INVALID_POINTER {
            Pointer::Invalid
        } else {
            Pointer::Valid(addr)
        }
    }

    pub const fn to_raw(self) -> Addr {
        match self {
            Pointer::Valid(addr) => addr,
            Pointer::Invalid => INVALID_POINTER,
        }
    }

    pub const fn is_valid(self) -> bool {
        matches!(self, Pointer::Valid(_))
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pointer::Valid(addr) => write!(f, "0x{addr:08x}"),
            Pointer::Invalid => write!(f, "<invalid>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte = 1,
    Half = 2,
    Word = 4,
}

impl Width {
    pub const fn bytes(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signedness {
    Signed,
    Unsigned,
}

/// Kind of a checked load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
}

impl Access {
    pub const fn new(width: Width, signedness: Signedness) -> Self {
        match (width, signedness) {
            (Width::Byte, Signedness::Signed) => Access::I8,
            (Width::Byte, Signedness::Unsigned) => Access::U8,
            (Width::Half, Signedness::Signed) => Access::I16,
            (Width::Half, Signedness::Unsigned) => Access::U16,
            (Width::Word, Signedness::Signed) => Access::I32,
            (Width::Word, Signedness::Unsigned) => Access::U32,
        }
    }

    pub const fn width(self) -> Width {
        match self {
            Access::I8 | Access::U8 => Width::Byte,
            Access::I16 | Access::U16 => Width::Half,
            Access::I32 | Access::U32 => Width::Word,
        }
    }

    pub const fn signedness(self) -> Signedness {
        match self {
            Access::I8 | Access::I16 | Access::I32 => Signedness::Signed,
            Access::U8 | Access::U16 | Access::U32 => Signedness::Unsigned,
        }
    }

    /// Reads a value of this kind from `bytes`, sign or zero extending it.
    ///
    /// Returns `None` if `bytes` is not exactly as wide as the access.
    pub fn decode(self, bytes: &[u8]) -> Option<i64> {
        fn decode_as<T: Scalar>(bytes: &[u8]) -> Option<i64> {
            T::read_from_bytes(bytes).ok().map(AsPrimitive::<i64>::as_)
        }
        match self {
            Access::I8 => decode_as::<i8>(bytes),
            Access::U8 => decode_as::<u8>(bytes),
            Access::I16 => decode_as::<i16>(bytes),
            Access::U16 => decode_as::<u16>(bytes),
            Access::I32 => decode_as::<i32>(bytes),
            Access::U32 => decode_as::<u32>(bytes),
        }
    }

    /// Truncates `value` to this access width and returns its bytes.
    pub fn encode(self, value: i64) -> SmallVec<[u8; 4]> {
        fn encode_as<T: Scalar>(value: i64) -> SmallVec<[u8; 4]> {
            SmallVec::from_slice(T::truncate(value).as_bytes())
        }
        match self {
            Access::I8 => encode_as::<i8>(value),
            Access::U8 => encode_as::<u8>(value),
            Access::I16 => encode_as::<i16>(value),
            Access::U16 => encode_as::<u16>(value),
            Access::I32 => encode_as::<i32>(value),
            Access::U32 => encode_as::<u32>(value),
        }
    }
}

impl FromStr for Access {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "i8" => Access::I8,
            "u8" => Access::U8,
            "i16" => Access::I16,
            "u16" => Access::U16,
            "i32" => Access::I32,
            "u32" => Access::U32,
            _ => bail!("unknown access type `{s}`, expected one of i8, u8, i16, u16, i32, u32"),
        })
    }
}

/// Scalar types that can be loaded and stored through checked accesses.
pub trait Scalar: Copy + fmt::Debug + FromBytes + IntoBytes + Immutable + AsPrimitive<i64> {
    const ACCESS: Access;

    /// Keeps the low bits of `value` that fit in `Self`.
    fn truncate(value: i64) -> Self;
}

macro_rules! impl_scalar {
    ($($ty:ty => $access:ident),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const ACCESS: Access = Access::$access;

                fn truncate(value: i64) -> Self {
                    value.as_()
                }
            }
        )*
    };
}

impl_scalar!(i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32, u32 => U32);

impl RegionTable {
    /// Bounds deciding whether `addr` may be used once `policy` is applied.
    #[inline]
    fn governing_bounds(&mut self, addr: Addr, policy: UntrackedPolicy) -> Bounds {
        let bounds = self.lookup(addr);
        if bounds == Bounds::EMPTY && policy == UntrackedPolicy::Forbid {
            Bounds::INVALID
        } else {
            bounds
        }
    }

    /// Computes `ptr + offset`, or [`Pointer::Invalid`] when the result leaves
    /// the region `ptr` points into.
    ///
    /// Never fails: pointing outside a region is allowed, only dereferencing
    /// such a pointer is not. The one-past-end address is still in bounds.
    pub fn ptr_add(&mut self, ptr: Pointer, offset: i32, policy: UntrackedPolicy) -> Pointer {
        let Pointer::Valid(addr) = ptr else {
            return Pointer::Invalid;
        };
        let bounds = self.governing_bounds(addr, policy);
        // Negative offsets wrap, which the unsigned compare rejects like overruns.
        let delta = offset as u32;
        if bounds.offset_of(addr).wrapping_add(delta) > bounds.size {
            trace!(
                addr = format_args!("0x{addr:08x}"),
                offset,
                "pointer arithmetic left its region"
            );
            return Pointer::Invalid;
        }
        Pointer::from_raw(addr.wrapping_add(delta))
    }

    /// Checks that `width` bytes at `ptr + offset` lie inside the region of
    /// `ptr` and returns the address to access.
    pub fn check_access(
        &mut self,
        ptr: Pointer,
        offset: i32,
        width: Width,
        policy: UntrackedPolicy,
    ) -> Result<Addr, Violation> {
        let width = width.bytes();
        let invalid = |addr| Violation::InvalidDeref {
            addr,
            offset,
            width,
        };
        let Pointer::Valid(addr) = ptr else {
            return Err(invalid(INVALID_POINTER));
        };

        let bounds = self.governing_bounds(addr, policy);
        let delta = offset as u32;
        let first = bounds.offset_of(addr).wrapping_add(delta);
        // Widened so the access width cannot wrap a far-off offset back in range.
        if u64::from(first) + u64::from(width) > u64::from(bounds.size) {
            return Err(invalid(addr));
        }
        Ok(addr.wrapping_add(delta))
    }
}
