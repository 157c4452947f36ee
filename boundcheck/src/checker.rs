//! The checking context handed to instrumented code.
//!
//! A [`BoundChecker`] owns one [`RegionTable`], the heap whose allocations it
//! brackets, and the configuration that decides how violations are reported.
//! Each operation comes in two flavours: `try_*` returns the [`Violation`],
//! while the plain variant hands it to the configured [`FatalAction`] and never
//! returns on failure.
//!
//! [`FatalAction`]: crate::FatalAction

use crate::Addr;
use crate::check::{Access, Pointer, Scalar};
use crate::config::Config;
use crate::memory::{ArenaHeap, MemorySegment, RawAllocator};
use crate::table::{BLOCK_SIZE, RegionTable};
use crate::violation::Violation;
use anyhow::Result;
use tracing::{debug, info};
use zerocopy::{FromBytes, IntoBytes};

/// Bounds-checking context.
#[derive(Debug)]
pub struct BoundChecker<H: RawAllocator = ArenaHeap> {
    table: RegionTable,
    heap: H,
    config: Config,
}

impl BoundChecker<ArenaHeap> {
    /// Creates a checker with a fresh [`ArenaHeap`] placed where `config`
    /// says.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let heap = ArenaHeap::new(config.heap_zone());
        Self::with_heap(config, heap)
    }
}

impl<H: RawAllocator> BoundChecker<H> {
    /// Creates a checker around an existing allocator.
    ///
    /// The allocator's zone and every reserved zone from `config` start out
    /// INVALID, so heap memory is only accessible while allocated. The heap
    /// zone is widened to whole blocks, since only fully covered blocks can
    /// be marked.
    pub fn with_heap(config: Config, heap: H) -> Result<Self> {
        let mut reserved = Vec::with_capacity(config.reserved_zones.len() + 1);
        reserved.push(heap.zone().round_out(BLOCK_SIZE));
        reserved.extend_from_slice(&config.reserved_zones);
        let table = RegionTable::bootstrap(&reserved)?;
        info!(
            heap = %heap.zone(),
            untracked = ?config.untracked,
            "bound checker ready"
        );
        Ok(Self {
            table,
            heap,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut RegionTable {
        &mut self.table
    }

    pub fn heap(&self) -> &H {
        &self.heap
    }

    fn fatal<T>(&self, result: Result<T, Violation>) -> T {
        result.unwrap_or_else(|violation| self.config.on_violation.raise(violation))
    }

    pub fn try_register_region(&mut self, addr: Addr, size: u32) -> Result<(), Violation> {
        self.table.new_region(addr, size)
    }

    /// Registers `[addr, addr + size)` as valid memory.
    pub fn register_region(&mut self, addr: Addr, size: u32) {
        let result = self.try_register_region(addr, size);
        self.fatal(result)
    }

    pub fn try_unregister_region(&mut self, addr: Addr) -> Result<(), Violation> {
        self.table.delete_region(addr)
    }

    /// Forgets the region starting at `addr`. Anything else is fatal.
    pub fn unregister_region(&mut self, addr: Addr) {
        let result = self.try_unregister_region(addr);
        self.fatal(result)
    }

    /// Pointer arithmetic. Never fatal: leaving the region yields
    /// [`Pointer::Invalid`].
    pub fn checked_advance(&mut self, ptr: Pointer, offset: i32) -> Pointer {
        self.table.ptr_add(ptr, offset, self.config.untracked)
    }

    /// Bounds checks `access` at `ptr + offset` and returns the bytes it covers.
    fn checked_bytes(
        &mut self,
        ptr: Pointer,
        offset: i32,
        access: Access,
    ) -> Result<&[u8], Violation> {
        let width = access.width();
        let addr = self
            .table
            .check_access(ptr, offset, width, self.config.untracked)?;
        let len = width.bytes();
        self.heap
            .read_addr(addr, len)
            .map_err(|_| Violation::Unmapped { addr, len })
    }

    fn checked_write(
        &mut self,
        ptr: Pointer,
        offset: i32,
        access: Access,
        bytes: &[u8],
    ) -> Result<(), Violation> {
        let width = access.width();
        let addr = self
            .table
            .check_access(ptr, offset, width, self.config.untracked)?;
        self.heap.write_addr(addr, bytes).map_err(|_| Violation::Unmapped {
            addr,
            len: width.bytes(),
        })
    }

    /// Loads `access` at `ptr + offset`, sign or zero extended.
    pub fn try_load(
        &mut self,
        ptr: Pointer,
        offset: i32,
        access: Access,
    ) -> Result<i64, Violation> {
        let bytes = self.checked_bytes(ptr, offset, access)?;
        let len = access.width().bytes();
        access.decode(bytes).ok_or(Violation::Unmapped {
            addr: ptr.to_raw().wrapping_add(offset as u32),
            len,
        })
    }

    pub fn load(&mut self, ptr: Pointer, offset: i32, access: Access) -> i64 {
        let result = self.try_load(ptr, offset, access);
        self.fatal(result)
    }

    /// Stores the low bits of `value` at `ptr + offset`.
    pub fn try_store(
        &mut self,
        ptr: Pointer,
        offset: i32,
        access: Access,
        value: i64,
    ) -> Result<(), Violation> {
        self.checked_write(ptr, offset, access, &access.encode(value))
    }

    pub fn store(&mut self, ptr: Pointer, offset: i32, access: Access, value: i64) {
        let result = self.try_store(ptr, offset, access, value);
        self.fatal(result)
    }

    pub fn try_load_as<T: Scalar>(&mut self, ptr: Pointer, offset: i32) -> Result<T, Violation> {
        let bytes = self.checked_bytes(ptr, offset, T::ACCESS)?;
        T::read_from_bytes(bytes).map_err(|_| Violation::Unmapped {
            addr: ptr.to_raw().wrapping_add(offset as u32),
            len: T::ACCESS.width().bytes(),
        })
    }

    /// Typed load. Same checks as [`BoundChecker::load`].
    pub fn load_as<T: Scalar>(&mut self, ptr: Pointer, offset: i32) -> T {
        let result = self.try_load_as(ptr, offset);
        self.fatal(result)
    }

    pub fn try_store_as<T: Scalar>(
        &mut self,
        ptr: Pointer,
        offset: i32,
        value: T,
    ) -> Result<(), Violation> {
        self.checked_write(ptr, offset, T::ACCESS, value.as_bytes())
    }

    pub fn store_as<T: Scalar>(&mut self, ptr: Pointer, offset: i32, value: T) {
        let result = self.try_store_as(ptr, offset, value);
        self.fatal(result)
    }

    /// Allocates `size` bytes and registers them as a region.
    ///
    /// Returns `Ok(None)` when the heap is out of memory.
    pub fn try_allocate(&mut self, size: u32) -> Result<Option<Addr>, Violation> {
        let Some(addr) = self.heap.raw_allocate(size) else {
            debug!(size, "heap exhausted");
            return Ok(None);
        };
        if let Err(violation) = self.table.new_region(addr, size) {
            self.heap.raw_deallocate(addr);
            return Err(violation);
        }
        Ok(Some(addr))
    }

    pub fn allocate(&mut self, size: u32) -> Option<Addr> {
        let result = self.try_allocate(size);
        self.fatal(result)
    }

    /// Allocates `count * size` zeroed bytes. Returns `Ok(None)` when the
    /// product overflows or the heap is out of memory.
    pub fn try_allocate_zeroed(
        &mut self,
        count: u32,
        size: u32,
    ) -> Result<Option<Addr>, Violation> {
        let Some(total) = count.checked_mul(size) else {
            debug!(count, size, "zeroed allocation size overflows");
            return Ok(None);
        };
        let Some(addr) = self.try_allocate(total)? else {
            return Ok(None);
        };
        let zeroes = vec![0; total as usize];
        self.heap
            .write_addr(addr, &zeroes)
            .map_err(|_| Violation::Unmapped { addr, len: total })?;
        Ok(Some(addr))
    }

    pub fn allocate_zeroed(&mut self, count: u32, size: u32) -> Option<Addr> {
        let result = self.try_allocate_zeroed(count, size);
        self.fatal(result)
    }

    /// Unregisters the region at `addr` and returns it to the heap.
    /// Releasing address 0 does nothing.
    pub fn try_deallocate(&mut self, addr: Addr) -> Result<(), Violation> {
        if addr == 0 {
            return Ok(());
        }
        self.table.delete_region(addr)?;
        self.heap.raw_deallocate(addr);
        Ok(())
    }

    pub fn deallocate(&mut self, addr: Addr) {
        let result = self.try_deallocate(addr);
        self.fatal(result)
    }

    /// Moves the region at `addr` into a block of `size` bytes.
    ///
    /// Address 0 allocates and a zero size frees. Otherwise a new block is
    /// registered, `min(old, new)` bytes are copied, and the old region is
    /// released. When the heap is out of memory the old region is left alone
    /// and `Ok(None)` is returned.
    pub fn try_reallocate(
        &mut self,
        addr: Addr,
        size: u32,
    ) -> Result<Option<Addr>, Violation> {
        if addr == 0 {
            return self.try_allocate(size);
        }
        if size == 0 {
            self.try_deallocate(addr)?;
            return Ok(None);
        }
        let old_size = self
            .table
            .region_size(addr)
            .ok_or(Violation::InvalidRealloc { addr })?;
        let Some(new_addr) = self.try_allocate(size)? else {
            return Ok(None);
        };
        let len = old_size.min(size);
        self.heap
            .copy_within(addr, new_addr, len)
            .map_err(|_| Violation::Unmapped { addr, len })?;
        self.try_deallocate(addr)?;
        debug!(
            from = format_args!("0x{addr:08x}"),
            to = format_args!("0x{new_addr:08x}"),
            old_size,
            size,
            "reallocated"
        );
        Ok(Some(new_addr))
    }

    pub fn reallocate(&mut self, addr: Addr, size: u32) -> Option<Addr> {
        let result = self.try_reallocate(addr, size);
        self.fatal(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::INVALID_POINTER;
    use crate::config::{FatalAction, UntrackedPolicy};
    use crate::memory::Zone;
    use crate::table::Resolution;

    /// Checker whose heap occupies `[0x1000, 0x2000)`.
    fn checker() -> BoundChecker {
        let config = Config::default()
            .with_fatal_action(FatalAction::Panic)
            .with_heap(0x1000, 0x1000);
        BoundChecker::new(config).unwrap()
    }

    #[test]
    fn test_register_then_access() {
        let mut checker = checker();
        let base = Pointer::Valid(0x1000);
        checker.register_region(0x1000, 16);

        assert_eq!(checker.try_load(base, 15, Access::U8), Ok(0));
        assert_eq!(
            checker.try_load(base, 16, Access::U8),
            Err(Violation::InvalidDeref {
                addr: 0x1000,
                offset: 16,
                width: 1
            })
        );

        checker.unregister_region(0x1000);
        assert!(checker.try_load(base, 0, Access::U8).is_err());
    }

    #[test]
    fn test_freed_memory_in_partial_heap_block_is_invalid() {
        let config = Config::default()
            .with_fatal_action(FatalAction::Panic)
            .with_heap(0x1000, 0x180);
        let mut checker = BoundChecker::new(config).unwrap();
        assert_eq!(checker.allocate(255), Some(0x1000));
        // Lands in the heap's last block, which the heap only half covers
        let tail = checker.allocate(8).unwrap();
        assert_eq!(tail, 0x1100);
        checker.store(Pointer::Valid(tail), 0, Access::U8, 42);
        checker.deallocate(tail);

        assert_eq!(checker.table_mut().classify(tail), Resolution::Forbidden);
        assert_eq!(
            checker.try_load(Pointer::Valid(tail), 0, Access::U8),
            Err(Violation::InvalidDeref {
                addr: tail,
                offset: 0,
                width: 1
            })
        );
        checker.deallocate(0x1000);
        assert_eq!(checker.table_mut().classify(0x1000), Resolution::Forbidden);
    }

    #[test]
    #[should_panic(expected = "bounds check: dereferencing invalid pointer 0x00001000 (offset 16, 1 bytes)")]
    fn test_overrun_is_fatal() {
        let mut checker = checker();
        checker.register_region(0x1000, 16);
        checker.load(Pointer::Valid(0x1000), 16, Access::U8);
    }

    #[test]
    #[should_panic(expected = "bounds check: dereferencing invalid pointer")]
    fn test_reserved_zone_is_fatal() {
        let config = Config::default()
            .with_fatal_action(FatalAction::Panic)
            .with_reserved_zone(Zone::new(0x2000_0000, 0x1000));
        let mut checker = BoundChecker::new(config).unwrap();
        checker.load(Pointer::Valid(0x2000_0010), 0, Access::I32);
    }

    #[test]
    fn test_advance_past_end_is_deferred() {
        let mut checker = checker();
        let base = Pointer::Valid(0x1000);
        checker.register_region(0x1000, 16);

        let end = checker.checked_advance(base, 16);
        assert_eq!(end, Pointer::Valid(0x1010));
        let past = checker.checked_advance(base, 17);
        assert_eq!(past, Pointer::Invalid);
        assert_eq!(checker.checked_advance(past, -17), Pointer::Invalid);

        assert_eq!(
            checker.try_load(past, 0, Access::U8),
            Err(Violation::InvalidDeref {
                addr: INVALID_POINTER,
                offset: 0,
                width: 1
            })
        );
    }

    #[test]
    fn test_untracked_memory() {
        let config = Config::default().with_fatal_action(FatalAction::Panic);
        let mut checker = BoundChecker::new(config.clone()).unwrap();
        let ptr = Pointer::Valid(0x0040_0000);

        // Permitted by the table, but nothing backs it
        assert_eq!(
            checker.try_load(ptr, 0, Access::U8),
            Err(Violation::Unmapped {
                addr: 0x0040_0000,
                len: 1
            })
        );

        let mut strict =
            BoundChecker::new(config.with_untracked(UntrackedPolicy::Forbid)).unwrap();
        assert!(matches!(
            strict.try_load(ptr, 0, Access::U8),
            Err(Violation::InvalidDeref { .. })
        ));
        assert_eq!(strict.table_mut().classify(0x0040_0000), Resolution::Untracked);
    }

    #[test]
    fn test_load_and_store() {
        let mut checker = checker();
        let ptr = Pointer::Valid(checker.allocate(16).unwrap());

        checker.store(ptr, 0, Access::I8, -1);
        assert_eq!(checker.load(ptr, 0, Access::U8), 255);
        assert_eq!(checker.load(ptr, 0, Access::I8), -1);

        checker.store_as::<u32>(ptr, 12, 0xdead_beef);
        assert_eq!(checker.load_as::<u32>(ptr, 12), 0xdead_beef);
        let high = checker.load_as::<u16>(ptr, 14);
        assert_eq!(checker.load(ptr, 14, Access::U16), i64::from(high));
        assert_eq!(checker.load(ptr, 14, Access::I16), i64::from(high as i16));
        assert!(checker.try_store_as::<u32>(ptr, 13, 1).is_err());
        assert!(checker.try_load_as::<u16>(ptr, -1).is_err());
    }

    #[test]
    fn test_allocation_lifecycle() {
        let mut checker = checker();
        let a = checker.allocate(24).unwrap();
        assert_eq!(checker.table_mut().region_size(a), Some(24));

        checker.deallocate(a);
        // Freed heap memory reverts to the heap zone's INVALID disposition
        assert_eq!(checker.table_mut().classify(a), Resolution::Forbidden);
        assert_eq!(
            checker.try_deallocate(a),
            Err(Violation::InvalidDelete { addr: a })
        );
        checker.deallocate(0);
        assert_eq!(checker.heap().live_blocks(), 0);
    }

    #[test]
    fn test_allocate_out_of_memory() {
        let mut checker = checker();
        let before = checker.table().stats();
        assert_eq!(checker.allocate(0x1000), None);
        assert_eq!(checker.table().stats(), before);
    }

    #[test]
    fn test_allocate_zeroed() {
        let mut checker = checker();
        let a = checker.allocate(16).unwrap();
        checker.store_as::<u32>(Pointer::Valid(a), 0, u32::MAX);
        checker.deallocate(a);

        let b = checker.allocate_zeroed(4, 4).unwrap();
        assert_eq!(b, a);
        assert_eq!(checker.load_as::<u32>(Pointer::Valid(b), 0), 0);
        assert_eq!(checker.allocate_zeroed(0x1_0000, 0x1_0000), None);
    }

    #[test]
    fn test_reallocate() {
        let mut checker = checker();
        let a = checker.allocate(8).unwrap();
        checker.store_as::<u32>(Pointer::Valid(a), 4, u32::from_le_bytes([4, 3, 2, 1]));

        let b = checker.reallocate(a, 32).unwrap();
        assert_ne!(a, b);
        assert_eq!(
            checker.load_as::<u32>(Pointer::Valid(b), 4),
            u32::from_le_bytes([4, 3, 2, 1])
        );
        assert_eq!(checker.table_mut().region_size(b), Some(32));
        assert!(checker.try_load(Pointer::Valid(a), 0, Access::U8).is_err());

        // Shrinking keeps the prefix
        let c = checker.reallocate(b, 6).unwrap();
        assert_eq!(
            checker.load_as::<u16>(Pointer::Valid(c), 4),
            u16::from_ne_bytes([0x04, 0x03])
        );
        assert!(checker.try_load_as::<u16>(Pointer::Valid(c), 6).is_err());
    }

    #[test]
    fn test_reallocate_edge_cases() {
        let mut checker = checker();
        let a = checker.reallocate(0, 8).unwrap();
        assert_eq!(checker.table_mut().region_size(a), Some(8));

        assert_eq!(
            checker.try_reallocate(a + 1, 8),
            Err(Violation::InvalidRealloc { addr: a + 1 })
        );
        // Out of memory leaves the old region alone
        assert_eq!(checker.reallocate(a, 0x1000), None);
        assert_eq!(checker.table_mut().region_size(a), Some(8));

        assert_eq!(checker.reallocate(a, 0), None);
        assert_eq!(checker.heap().live_blocks(), 0);
    }

    #[test]
    #[should_panic(expected = "bounds check: realloc'ing invalid pointer 0x00001004")]
    fn test_invalid_realloc_is_fatal() {
        let mut checker = checker();
        checker.reallocate(0x1004, 8);
    }
}
