//! Process-wide checker for instrumented code.
//!
//! Instrumented code has no way to thread a [`BoundChecker`] through every
//! call, so [`init`] installs one behind a global lock and the free functions
//! here forward to it. They speak raw addresses: a null allocation is `0` and
//! an out-of-bounds pointer is [`INVALID_POINTER`](crate::INVALID_POINTER).

use crate::Addr;
use crate::check::{Access, Pointer, Signedness, Width};
use crate::checker::BoundChecker;
use crate::config::Config;
use anyhow::{Result, anyhow};
use std::sync::{Mutex, OnceLock, PoisonError};

/// Global singleton checker instance
static CHECKER: OnceLock<Mutex<BoundChecker>> = OnceLock::new();

/// Installs the global checker. Must run before any other function here.
///
/// # Returns
/// * `Ok(())` - The checker is ready
/// * `Err(anyhow::Error)` - Invalid configuration, or already initialized
pub fn init(config: Config) -> Result<()> {
    let checker = BoundChecker::new(config)?;
    CHECKER
        .set(Mutex::new(checker))
        .map_err(|_| anyhow!("bound checker already initialized"))
}

pub fn is_initialized() -> bool {
    CHECKER.get().is_some()
}

/// Runs `f` with exclusive access to the global checker.
///
/// A violation raised with [`crate::FatalAction::Panic`] poisons the lock; the
/// table is consistent at that point, so the poison is ignored.
pub fn with_checker<R>(f: impl FnOnce(&mut BoundChecker) -> R) -> R {
    let Some(checker) = CHECKER.get() else {
        panic!("bound checker used before global::init");
    };
    let mut guard = checker.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

pub fn register_region(addr: Addr, size: u32) {
    with_checker(|checker| checker.register_region(addr, size))
}

pub fn unregister_region(addr: Addr) {
    with_checker(|checker| checker.unregister_region(addr))
}

/// Returns `ptr + offset`, or `INVALID_POINTER` if that leaves the region.
pub fn checked_advance(ptr: Addr, offset: i32) -> Addr {
    with_checker(|checker| {
        checker
            .checked_advance(Pointer::from_raw(ptr), offset)
            .to_raw()
    })
}

pub fn checked_load(ptr: Addr, offset: i32, width: Width, signedness: Signedness) -> i64 {
    let access = Access::new(width, signedness);
    with_checker(|checker| checker.load(Pointer::from_raw(ptr), offset, access))
}

pub fn checked_store(ptr: Addr, offset: i32, width: Width, value: i64) {
    let access = Access::new(width, Signedness::Unsigned);
    with_checker(|checker| checker.store(Pointer::from_raw(ptr), offset, access, value))
}

pub fn checked_allocate(size: u32) -> Addr {
    with_checker(|checker| checker.allocate(size).unwrap_or(0))
}

pub fn checked_allocate_zeroed(count: u32, size: u32) -> Addr {
    with_checker(|checker| checker.allocate_zeroed(count, size).unwrap_or(0))
}

pub fn checked_deallocate(addr: Addr) {
    with_checker(|checker| checker.deallocate(addr))
}

pub fn checked_reallocate(addr: Addr, size: u32) -> Addr {
    with_checker(|checker| checker.reallocate(addr, size).unwrap_or(0))
}
