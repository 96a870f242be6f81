/*!
 * Accounting Tests
 * Reservation protocol, rollback on failure, usage aggregation
 */

use pretty_assertions::assert_eq;
use query_mempool::core::types::{MachinePageCount, Size};
use query_mempool::memory::{
    Allocation, ContiguousAllocation, MallocAllocator, MemoryManagerOptions, RawAllocator,
    ReservationFn,
};
use query_mempool::{MemoryError, MemoryManager, MemoryPool, PoolKind};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Allocator that starts failing physical allocation after a budget of
/// successful calls, for exercising the rollback paths.
struct FlakyAllocator {
    inner: MallocAllocator,
    successes_left: AtomicUsize,
}

impl FlakyAllocator {
    fn failing_after(successes: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MallocAllocator::new(),
            successes_left: AtomicUsize::new(successes),
        })
    }

    fn take_success(&self) -> bool {
        self.successes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
    }
}

impl RawAllocator for FlakyAllocator {
    fn allocate_bytes(&self, size: Size, alignment: Size) -> Option<NonNull<u8>> {
        self.take_success()
            .then(|| self.inner.allocate_bytes(size, alignment))
            .flatten()
    }

    fn allocate_zero_filled(&self, size: Size) -> Option<NonNull<u8>> {
        self.take_success()
            .then(|| self.inner.allocate_zero_filled(size))
            .flatten()
    }

    unsafe fn free_bytes(&self, ptr: NonNull<u8>, size: Size) {
        self.inner.free_bytes(ptr, size)
    }

    fn allocate_non_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        reservation: ReservationFn<'_>,
        min_size_class: MachinePageCount,
    ) -> Result<bool, MemoryError> {
        if !self.take_success() {
            let bytes = (num_pages * 4096) as i64;
            reservation(bytes, true)?;
            let _ = reservation(bytes, false);
            return Ok(false);
        }
        self.inner
            .allocate_non_contiguous(num_pages, out, reservation, min_size_class)
    }

    fn free_non_contiguous(&self, allocation: &mut Allocation) -> i64 {
        self.inner.free_non_contiguous(allocation)
    }

    fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut ContiguousAllocation,
        reservation: ReservationFn<'_>,
    ) -> Result<bool, MemoryError> {
        if !self.take_success() {
            let bytes = (num_pages * 4096) as i64;
            reservation(bytes, true)?;
            let _ = reservation(bytes, false);
            return Ok(false);
        }
        self.inner.allocate_contiguous(num_pages, out, reservation)
    }

    fn free_contiguous(&self, allocation: &mut ContiguousAllocation) -> i64 {
        self.inner.free_contiguous(allocation)
    }

    fn largest_size_class(&self) -> MachinePageCount {
        self.inner.largest_size_class()
    }

    fn size_classes(&self) -> &[MachinePageCount] {
        self.inner.size_classes()
    }

    fn kind(&self) -> &str {
        "FLAKY"
    }
}

fn flaky_leaf(
    successes: usize,
    capacity: usize,
) -> (Arc<MemoryManager>, Arc<MemoryPool>, Arc<MemoryPool>) {
    let manager = Arc::new(MemoryManager::with_options(MemoryManagerOptions {
        capacity,
        allocator: Some(FlakyAllocator::failing_after(successes)),
        ..Default::default()
    }));
    let root = manager.get_root_pool("query");
    let leaf = root.add_child("op", PoolKind::Leaf);
    (manager, root, leaf)
}

#[test]
fn test_end_to_end_capacity_scenario() {
    crate::init_logging();
    let manager = Arc::new(MemoryManager::with_capacity(1024 * 1024));
    let root = manager.get_root_pool("query");
    let a = root.add_child("a", PoolKind::Leaf);

    let ptr = a.allocate(1000).unwrap();
    assert_eq!(a.current_bytes(), 1008); // aligned to 16

    let err = a.allocate(2_000_000).unwrap_err();
    match err {
        MemoryError::CapacityExceeded { quota } => assert_eq!(quota, 1024 * 1024),
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
    assert_eq!(a.current_bytes(), 1008);

    unsafe { a.free(ptr, 1000) };
    assert_eq!(a.current_bytes(), 0);
    assert_eq!(root.current_bytes(), 0);
}

#[test]
fn test_capacity_error_reports_quota_in_mb() {
    let manager = Arc::new(MemoryManager::with_capacity(1024 * 1024));
    let root = manager.get_root_pool("query");
    let leaf = root.add_child("op", PoolKind::Leaf);

    let err = leaf.allocate(2 * 1024 * 1024).unwrap_err();
    assert!(err.is_retriable());
    assert_eq!(err.to_string(), "Exceeded memory cap of 1 MB");
}

#[test]
fn test_allocation_failure_rolls_back_reservation() {
    crate::init_logging();
    let (_manager, root, leaf) = flaky_leaf(0, 1 << 30);

    let err = leaf.allocate(4096).unwrap_err();
    match &err {
        MemoryError::AllocationFailed { pool, op, size } => {
            assert!(pool.contains("op"));
            assert!(pool.contains("LEAF"));
            assert_eq!(*op, "allocate");
            assert_eq!(*size, 4096);
        }
        other => panic!("expected AllocationFailed, got {other:?}"),
    }
    assert!(!err.is_retriable());
    assert_eq!(leaf.current_bytes(), 0);
    assert_eq!(leaf.tracker().current_bytes(), 0);
    assert_eq!(root.current_bytes(), 0);
}

#[test]
fn test_failed_reallocate_frees_old_block() {
    let (manager, root, leaf) = flaky_leaf(1, 1 << 30);

    let ptr = leaf.allocate(256).unwrap();
    assert_eq!(leaf.current_bytes(), 256);

    // Second physical allocation fails; the old block must be freed and
    // all accounting must return to the pre-call state.
    let err = unsafe { leaf.reallocate(Some(ptr), 256, 512) }.unwrap_err();
    assert!(matches!(err, MemoryError::AllocationFailed { .. }));
    assert_eq!(leaf.current_bytes(), 0);
    assert_eq!(root.current_bytes(), 0);
    assert_eq!(manager.reserved_bytes(), 0);
}

#[test]
fn test_non_contiguous_failure_leaves_descriptor_empty() {
    let (_manager, _root, leaf) = flaky_leaf(0, 1 << 30);
    let mut out = Allocation::new();

    let err = leaf.allocate_non_contiguous(4, &mut out, 0).unwrap_err();
    assert!(matches!(err, MemoryError::AllocationFailed { .. }));
    assert!(out.empty());
    assert_eq!(leaf.current_bytes(), 0);
}

#[test]
fn test_contiguous_failure_rolls_back() {
    let (_manager, _root, leaf) = flaky_leaf(0, 1 << 30);
    let mut out = ContiguousAllocation::new();

    let err = leaf.allocate_contiguous(4, &mut out).unwrap_err();
    assert!(matches!(err, MemoryError::AllocationFailed { .. }));
    assert!(out.empty());
    assert_eq!(leaf.current_bytes(), 0);
}

#[test]
fn test_max_bytes_tracks_peak_of_sequence() {
    let manager = Arc::new(MemoryManager::with_capacity(1 << 20));
    let root = manager.get_root_pool("query");
    let leaf = root.add_child("op", PoolKind::Leaf);

    let p1 = leaf.allocate(1600).unwrap();
    let p2 = leaf.allocate(3200).unwrap();
    let peak = leaf.current_bytes();
    unsafe { leaf.free(p1, 1600) };
    let p3 = leaf.allocate(160).unwrap();

    assert!(leaf.current_bytes() < peak);
    assert_eq!(leaf.max_bytes(), peak);
    assert_eq!(root.max_bytes(), peak);

    unsafe {
        leaf.free(p2, 3200);
        leaf.free(p3, 160);
    }
    // The high-water mark is monotone under frees
    assert_eq!(leaf.max_bytes(), peak);
}

#[test]
fn test_tracker_reflects_cumulative_allocation() {
    let manager = Arc::new(MemoryManager::with_capacity(1 << 20));
    let root = manager.get_root_pool("query");
    let leaf = root.add_child("op", PoolKind::Leaf);

    let p1 = leaf.allocate(16).unwrap();
    let p2 = leaf.allocate(32).unwrap();
    unsafe {
        leaf.free(p1, 16);
        leaf.free(p2, 32);
    }

    assert_eq!(leaf.tracker().num_allocs(), 2);
    assert_eq!(leaf.tracker().cumulative_bytes(), 48);
    assert_eq!(leaf.tracker().current_bytes(), 0);
    assert_eq!(leaf.tracker().peak_bytes(), 48);
    assert_eq!(root.tracker().current_bytes(), 0);
}

#[test]
#[should_panic(expected = "should be destroyed only after all allocated memory has been freed")]
fn test_leak_check_fires_at_teardown() {
    crate::init_logging();
    let manager = Arc::new(MemoryManager::with_options(MemoryManagerOptions {
        capacity: 1 << 20,
        leak_check_enabled: true,
        ..Default::default()
    }));
    let root = manager.get_root_pool("query");
    let leaf = root.add_child("op", PoolKind::Leaf);

    let _leaked = leaf.allocate(64).unwrap();
    drop(leaf);
}
