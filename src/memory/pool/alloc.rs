/*!
 * Pool Allocation Engine
 *
 * Byte and page allocation with reservation accounting. Every public
 * entry point aligns its size before reserving, and frees release
 * exactly the aligned amount reserved at allocation time, so reserve
 * and release are paired per logical allocation.
 */

use super::MemoryPool;
use crate::core::limits::PAGE_SIZE;
use crate::core::types::{MachinePageCount, Size};
use crate::memory::allocator::{Allocation, ContiguousAllocation};
use crate::memory::types::{MemoryError, MemoryResult};
use log::{error, warn};
use std::ptr::NonNull;
use std::sync::Arc;

/// Scoped reservation: accounting bytes acquired against the tracker,
/// local counters, and the capacity manager. Released on drop unless
/// committed, so every allocation failure branch rolls back without
/// hand-written compensation.
struct Reservation<'a> {
    pool: &'a MemoryPool,
    size: Size,
    committed: bool,
}

impl<'a> Reservation<'a> {
    fn acquire(pool: &'a MemoryPool, size: Size) -> MemoryResult<Self> {
        pool.reserve(size)?;
        Ok(Self {
            pool,
            size,
            committed: false,
        })
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.release(self.size);
        }
    }
}

impl MemoryPool {
    /// Allocate `size` bytes. The size is aligned up to the pool
    /// alignment before reservation and physical allocation.
    pub fn allocate(&self, size: Size) -> MemoryResult<NonNull<u8>> {
        self.check_memory_allocation();

        let aligned_size = self.size_align(size);
        let reservation = Reservation::acquire(self, aligned_size)?;
        match self.raw_allocator().allocate_bytes(aligned_size, self.alignment()) {
            Some(ptr) => {
                reservation.commit();
                Ok(ptr)
            }
            None => Err(self.alloc_error("allocate", size)),
        }
    }

    /// Allocate `num_entries * size_each` zero-initialized bytes
    pub fn allocate_zero_filled(
        &self,
        num_entries: Size,
        size_each: Size,
    ) -> MemoryResult<NonNull<u8>> {
        self.check_memory_allocation();

        let aligned_size = self.size_align(num_entries * size_each);
        let reservation = Reservation::acquire(self, aligned_size)?;
        match self.raw_allocator().allocate_zero_filled(aligned_size) {
            Some(ptr) => {
                reservation.commit();
                Ok(ptr)
            }
            None => Err(self.alloc_error("allocate_zero_filled", num_entries * size_each)),
        }
    }

    /// Move an allocation to a fresh block of `new_size` bytes, copying
    /// `min(size, new_size)` bytes. With `ptr == None` this is a plain
    /// `allocate(new_size)` with no copy.
    ///
    /// A capacity denial leaves the old block untouched so the caller
    /// can free memory elsewhere and retry. A physical allocation
    /// failure frees the old block before surfacing, never leaking it.
    ///
    /// # Safety
    /// `ptr`, when present, must come from an allocation of `size` bytes
    /// on this pool; after a successful call or a physical allocation
    /// failure it must not be used again.
    pub unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        size: Size,
        new_size: Size,
    ) -> MemoryResult<NonNull<u8>> {
        self.check_memory_allocation();

        let aligned_new_size = self.size_align(new_size);
        let reservation = Reservation::acquire(self, aligned_new_size)?;
        let new_ptr = match self
            .raw_allocator()
            .allocate_bytes(aligned_new_size, self.alignment())
        {
            Some(new_ptr) => new_ptr,
            None => {
                if let Some(old) = ptr {
                    self.free(old, size);
                }
                return Err(self.alloc_error("reallocate", new_size));
            }
        };
        reservation.commit();

        if let Some(old) = ptr {
            std::ptr::copy_nonoverlapping(old.as_ptr(), new_ptr.as_ptr(), size.min(new_size));
            self.free(old, size);
        }
        Ok(new_ptr)
    }

    /// Free a block of `size` bytes, releasing the aligned amount that
    /// was reserved for it.
    ///
    /// # Safety
    /// `ptr` must come from an allocation of `size` bytes on this pool
    /// and must not be used again.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: Size) {
        self.check_memory_allocation();

        let aligned_size = self.size_align(size);
        self.raw_allocator().free_bytes(ptr, aligned_size);
        self.release(aligned_size);
    }

    /// Allocate `num_pages` machine pages as size-class runs.
    ///
    /// Reservation follows the bytes the allocator actually grants, not
    /// the nominal request. On failure `out` ends empty; on success it
    /// is tagged with this pool as owner.
    pub fn allocate_non_contiguous(
        self: &Arc<Self>,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        min_size_class: MachinePageCount,
    ) -> MemoryResult<()> {
        self.check_memory_allocation();
        assert!(num_pages > 0, "non-contiguous allocation of zero pages");

        let mut reservation = |bytes: i64, pre_alloc: bool| -> MemoryResult<()> {
            if pre_alloc {
                self.reserve(bytes as Size)
            } else {
                self.release(bytes as Size);
                Ok(())
            }
        };
        if !self.raw_allocator().allocate_non_contiguous(
            num_pages,
            out,
            &mut reservation,
            min_size_class,
        )? {
            assert!(out.empty());
            return Err(self.alloc_error("allocate_non_contiguous", num_pages * PAGE_SIZE));
        }
        assert!(!out.empty());
        assert!(out.pool().is_none(), "allocation already owned by a pool");
        out.set_pool(self);
        Ok(())
    }

    /// Free a non-contiguous allocation, releasing the exact byte count
    /// the allocator reports as freed.
    pub fn free_non_contiguous(self: &Arc<Self>, allocation: &mut Allocation) {
        self.check_memory_allocation();
        self.check_descriptor_owner(allocation.pool());

        let freed_bytes = self.raw_allocator().free_non_contiguous(allocation);
        assert!(allocation.empty());
        self.release(freed_bytes as Size);
    }

    /// Allocate `num_pages` as one contiguous region; same reservation
    /// and ownership contract as `allocate_non_contiguous`.
    pub fn allocate_contiguous(
        self: &Arc<Self>,
        num_pages: MachinePageCount,
        out: &mut ContiguousAllocation,
    ) -> MemoryResult<()> {
        self.check_memory_allocation();
        assert!(num_pages > 0, "contiguous allocation of zero pages");

        let mut reservation = |bytes: i64, pre_alloc: bool| -> MemoryResult<()> {
            if pre_alloc {
                self.reserve(bytes as Size)
            } else {
                self.release(bytes as Size);
                Ok(())
            }
        };
        if !self
            .raw_allocator()
            .allocate_contiguous(num_pages, out, &mut reservation)?
        {
            assert!(out.empty());
            return Err(self.alloc_error("allocate_contiguous", num_pages * PAGE_SIZE));
        }
        assert!(!out.empty());
        assert!(out.pool().is_none(), "allocation already owned by a pool");
        out.set_pool(self);
        Ok(())
    }

    /// Free a contiguous allocation
    pub fn free_contiguous(self: &Arc<Self>, allocation: &mut ContiguousAllocation) {
        self.check_memory_allocation();
        self.check_descriptor_owner(allocation.pool());

        let bytes_to_free = allocation.size();
        let freed = self.raw_allocator().free_contiguous(allocation);
        assert!(allocation.empty());
        debug_assert_eq!(freed as Size, bytes_to_free);
        self.release(bytes_to_free);
    }

    /// Local bytes plus everything allocated anywhere in the descendant
    /// subtree
    pub fn current_bytes(&self) -> i64 {
        self.aggregate_bytes()
    }

    /// High-water mark across local and subtree usage
    pub fn max_bytes(&self) -> i64 {
        self.subtree_max_bytes().max(self.local_usage().max_bytes())
    }

    pub fn aggregate_bytes(&self) -> i64 {
        self.local_usage().current_bytes() + self.subtree_usage().current_bytes()
    }

    pub fn subtree_max_bytes(&self) -> i64 {
        self.subtree_usage().max_bytes()
    }

    /// Bytes this pool allocated directly
    pub fn local_bytes(&self) -> i64 {
        self.local_usage().current_bytes()
    }

    /// Align a size up to the pool alignment
    pub(crate) fn size_align(&self, size: Size) -> Size {
        let remainder = size % self.alignment();
        if remainder == 0 {
            size
        } else {
            size + self.alignment() - remainder
        }
    }

    /// Pre-account `size` bytes: tracker, local counter, ancestor
    /// subtree counters, then the capacity manager. A manager denial
    /// rolls everything back through `release` before surfacing, so no
    /// accounting state reflects memory that was never granted.
    ///
    /// Reservation and physical allocation are deliberately not one
    /// atomic transaction; intermediate aggregates can only be inflated,
    /// never understated.
    pub(crate) fn reserve(&self, size: Size) -> MemoryResult<()> {
        self.tracker().update(size as i64);
        self.local_usage().increment(size as i64);
        self.update_subtree_chain(size as i64);

        if !self.manager().reserve(size) {
            self.release(size);
            let quota = self.manager().memory_quota();
            warn!(
                "Reservation of {} bytes denied for {}: memory cap of {} MB exceeded",
                size,
                self,
                quota / 1024 / 1024
            );
            return Err(MemoryError::CapacityExceeded { quota });
        }
        Ok(())
    }

    /// Undo a reservation of `size` bytes
    pub(crate) fn release(&self, size: Size) {
        self.manager().release(size);
        self.local_usage().increment(-(size as i64));
        self.update_subtree_chain(-(size as i64));
        self.tracker().update(-(size as i64));
    }

    /// Propagate a usage delta to every ancestor's subtree record.
    /// Incremental maintenance: aggregates are never recomputed by
    /// walking children, which would take every descendant's lock.
    fn update_subtree_chain(&self, delta: i64) {
        let mut ancestor = self.parent().map(Arc::as_ref);
        while let Some(pool) = ancestor {
            pool.subtree_usage().increment(delta);
            ancestor = pool.parent().map(Arc::as_ref);
        }
    }

    fn check_descriptor_owner(&self, owner: Option<Arc<MemoryPool>>) {
        if let Some(owner) = owner {
            assert!(
                std::ptr::eq(owner.as_ref(), self),
                "allocation owned by {owner} freed through {self}"
            );
        }
    }

    fn alloc_error(&self, op: &'static str, size: Size) -> MemoryError {
        error!("{} failed with {} bytes from {}", op, size, self);
        MemoryError::AllocationFailed {
            pool: self.to_string(),
            op,
            size,
        }
    }
}
