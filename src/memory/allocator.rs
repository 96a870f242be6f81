/*!
 * Raw Allocator
 * Physical byte/page allocation boundary and page-run descriptors
 */

use crate::core::limits::{MAX_ALIGNMENT, MAX_SIZE_CLASS_PAGES, PAGE_SIZE};
use crate::core::types::{MachinePageCount, Size};
use crate::memory::pool::MemoryPool;
use crate::memory::types::MemoryResult;
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

/// Reservation callback invoked by page allocators.
///
/// Called with the actual granted byte count and `true` before physical
/// allocation (reserve accounting bytes) or `false` when backing out
/// (release). Page allocators may grant more than the nominal request,
/// so reservation tracks granted bytes, not the request.
pub type ReservationFn<'a> = &'a mut dyn FnMut(i64, bool) -> MemoryResult<()>;

/// One contiguous run of machine pages
#[derive(Debug, Clone, Copy)]
pub struct PageRun {
    pub ptr: NonNull<u8>,
    pub num_pages: MachinePageCount,
}

impl PageRun {
    pub fn byte_size(&self) -> Size {
        self.num_pages * PAGE_SIZE
    }
}

/// Non-contiguous page allocation descriptor
///
/// Describes a set of physical page runs plus a back-reference to the
/// owning pool, set exactly once at allocation time and cleared when the
/// allocation is freed.
#[derive(Debug, Default)]
pub struct Allocation {
    runs: Vec<PageRun>,
    pool: Option<Weak<MemoryPool>>,
}

impl Allocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn num_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn runs(&self) -> &[PageRun] {
        &self.runs
    }

    pub fn num_pages(&self) -> MachinePageCount {
        self.runs.iter().map(|run| run.num_pages).sum()
    }

    pub fn byte_size(&self) -> Size {
        self.num_pages() * PAGE_SIZE
    }

    /// Owning pool, if still alive
    pub fn pool(&self) -> Option<Arc<MemoryPool>> {
        self.pool.as_ref().and_then(Weak::upgrade)
    }

    /// Tag the owning pool. Panics if the descriptor is already owned.
    pub fn set_pool(&mut self, pool: &Arc<MemoryPool>) {
        assert!(
            self.pool.is_none(),
            "allocation already owned by a pool, cannot tag again"
        );
        self.pool = Some(Arc::downgrade(pool));
    }

    /// Record a run. Used by allocator implementations.
    pub fn append(&mut self, ptr: NonNull<u8>, num_pages: MachinePageCount) {
        self.runs.push(PageRun { ptr, num_pages });
    }

    /// Empty the descriptor, returning its runs. Used by allocators on
    /// free and on failure cleanup.
    pub fn release_runs(&mut self) -> Vec<PageRun> {
        self.pool = None;
        std::mem::take(&mut self.runs)
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // Skipped during unwinding: a double panic would abort
        if !std::thread::panicking() {
            assert!(
                self.runs.is_empty(),
                "allocation dropped while still holding {} page runs",
                self.runs.len()
            );
        }
    }
}

/// Contiguous page allocation descriptor
#[derive(Debug, Default)]
pub struct ContiguousAllocation {
    data: Option<PageRun>,
    pool: Option<Weak<MemoryPool>>,
}

impl ContiguousAllocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty(&self) -> bool {
        self.data.is_none()
    }

    pub fn ptr(&self) -> Option<NonNull<u8>> {
        self.data.map(|run| run.ptr)
    }

    pub fn num_pages(&self) -> MachinePageCount {
        self.data.map_or(0, |run| run.num_pages)
    }

    /// Size of the region in bytes
    pub fn size(&self) -> Size {
        self.num_pages() * PAGE_SIZE
    }

    pub fn pool(&self) -> Option<Arc<MemoryPool>> {
        self.pool.as_ref().and_then(Weak::upgrade)
    }

    /// Tag the owning pool. Panics if the descriptor is already owned.
    pub fn set_pool(&mut self, pool: &Arc<MemoryPool>) {
        assert!(
            self.pool.is_none(),
            "contiguous allocation already owned by a pool, cannot tag again"
        );
        self.pool = Some(Arc::downgrade(pool));
    }

    /// Record the region. Used by allocator implementations.
    pub fn set_data(&mut self, ptr: NonNull<u8>, num_pages: MachinePageCount) {
        self.data = Some(PageRun { ptr, num_pages });
    }

    /// Empty the descriptor, returning the region if any.
    pub fn release_data(&mut self) -> Option<PageRun> {
        self.pool = None;
        self.data.take()
    }
}

impl Drop for ContiguousAllocation {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(
                self.data.is_none(),
                "contiguous allocation dropped while still holding pages"
            );
        }
    }
}

/// Physical allocation boundary
///
/// Services byte and page requests for every pool routed through one
/// memory manager; implementations must be safe for concurrent
/// allocate/free from multiple pools.
pub trait RawAllocator: Send + Sync {
    /// Allocate `size` bytes at the given alignment, or None on exhaustion
    fn allocate_bytes(&self, size: Size, alignment: Size) -> Option<NonNull<u8>>;

    /// Allocate `size` zero-initialized bytes
    fn allocate_zero_filled(&self, size: Size) -> Option<NonNull<u8>>;

    /// Free a block previously returned by this allocator.
    ///
    /// # Safety
    /// `ptr` must come from `allocate_bytes`/`allocate_zero_filled` on
    /// this allocator with the same `size`, and must not be used again.
    unsafe fn free_bytes(&self, ptr: NonNull<u8>, size: Size);

    /// Allocate `num_pages` machine pages as a mix of size-class runs.
    ///
    /// Invokes `reservation` with the granted byte count before physical
    /// allocation and again (release) if allocation then fails. Returns
    /// `Ok(false)` on physical failure with `out` left empty, `Err` if
    /// the reservation callback itself failed.
    fn allocate_non_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        reservation: ReservationFn<'_>,
        min_size_class: MachinePageCount,
    ) -> MemoryResult<bool>;

    /// Free a non-contiguous allocation, returning the bytes freed.
    /// The descriptor is left empty.
    fn free_non_contiguous(&self, allocation: &mut Allocation) -> i64;

    /// Allocate `num_pages` as one contiguous region, same reservation
    /// protocol as `allocate_non_contiguous`
    fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut ContiguousAllocation,
        reservation: ReservationFn<'_>,
    ) -> MemoryResult<bool>;

    /// Free a contiguous allocation, returning the bytes freed
    fn free_contiguous(&self, allocation: &mut ContiguousAllocation) -> i64;

    fn largest_size_class(&self) -> MachinePageCount;

    fn size_classes(&self) -> &[MachinePageCount];

    /// Diagnostic kind string, used in pool renderings
    fn kind(&self) -> &str;
}

/// Default allocator over the global heap
///
/// Size classes are powers of two pages from 1 up to
/// `MAX_SIZE_CLASS_PAGES`. Byte allocations are carved at
/// `MAX_ALIGNMENT` so any supported pool alignment is satisfied and
/// frees need only the size.
pub struct MallocAllocator {
    size_classes: Vec<MachinePageCount>,
}

impl MallocAllocator {
    pub fn new() -> Self {
        let mut size_classes = Vec::new();
        let mut class = 1;
        while class <= MAX_SIZE_CLASS_PAGES {
            size_classes.push(class);
            class *= 2;
        }
        Self { size_classes }
    }

    /// Round a page request up to a mix of size-class runs, each at
    /// least `min_size_class` pages. The granted total may exceed the
    /// nominal request.
    fn size_class_mix(
        &self,
        num_pages: MachinePageCount,
        min_size_class: MachinePageCount,
    ) -> Vec<MachinePageCount> {
        let largest = self.largest_size_class();
        let mut mix = Vec::new();
        let mut remaining = num_pages.max(min_size_class);
        while remaining > 0 {
            let class = if remaining >= largest {
                largest
            } else {
                // Smallest class covering the remainder
                *self
                    .size_classes
                    .iter()
                    .find(|&&c| c >= remaining && c >= min_size_class)
                    .unwrap_or(&largest)
            };
            mix.push(class);
            remaining = remaining.saturating_sub(class);
        }
        mix
    }

    fn page_layout(num_pages: MachinePageCount) -> Layout {
        // PAGE_SIZE is a power of two and the size cannot overflow isize
        // for any size class, so this cannot fail.
        Layout::from_size_align(num_pages * PAGE_SIZE, PAGE_SIZE).unwrap()
    }

    fn byte_layout(size: Size) -> Layout {
        Layout::from_size_align(size, MAX_ALIGNMENT).unwrap()
    }
}

impl Default for MallocAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RawAllocator for MallocAllocator {
    fn allocate_bytes(&self, size: Size, alignment: Size) -> Option<NonNull<u8>> {
        assert!(
            alignment <= MAX_ALIGNMENT,
            "unsupported allocation alignment: {alignment}"
        );
        if size == 0 {
            return Some(NonNull::dangling());
        }
        NonNull::new(unsafe { alloc(Self::byte_layout(size)) })
    }

    fn allocate_zero_filled(&self, size: Size) -> Option<NonNull<u8>> {
        if size == 0 {
            return Some(NonNull::dangling());
        }
        NonNull::new(unsafe { alloc_zeroed(Self::byte_layout(size)) })
    }

    unsafe fn free_bytes(&self, ptr: NonNull<u8>, size: Size) {
        if size == 0 {
            return;
        }
        dealloc(ptr.as_ptr(), Self::byte_layout(size));
    }

    fn allocate_non_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut Allocation,
        reservation: ReservationFn<'_>,
        min_size_class: MachinePageCount,
    ) -> MemoryResult<bool> {
        debug_assert!(out.empty());
        let mix = self.size_class_mix(num_pages, min_size_class);
        let granted_bytes = (mix.iter().sum::<MachinePageCount>() * PAGE_SIZE) as i64;

        reservation(granted_bytes, true)?;

        for &class in &mix {
            match NonNull::new(unsafe { alloc(Self::page_layout(class)) }) {
                Some(ptr) => out.append(ptr, class),
                None => {
                    for run in out.release_runs() {
                        unsafe { dealloc(run.ptr.as_ptr(), Self::page_layout(run.num_pages)) };
                    }
                    // Back out the reservation; a release never fails
                    let _ = reservation(granted_bytes, false);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn free_non_contiguous(&self, allocation: &mut Allocation) -> i64 {
        let mut freed_bytes = 0i64;
        for run in allocation.release_runs() {
            freed_bytes += run.byte_size() as i64;
            unsafe { dealloc(run.ptr.as_ptr(), Self::page_layout(run.num_pages)) };
        }
        freed_bytes
    }

    fn allocate_contiguous(
        &self,
        num_pages: MachinePageCount,
        out: &mut ContiguousAllocation,
        reservation: ReservationFn<'_>,
    ) -> MemoryResult<bool> {
        debug_assert!(out.empty());
        let bytes = (num_pages * PAGE_SIZE) as i64;

        reservation(bytes, true)?;

        match NonNull::new(unsafe { alloc(Self::page_layout(num_pages)) }) {
            Some(ptr) => {
                out.set_data(ptr, num_pages);
                Ok(true)
            }
            None => {
                let _ = reservation(bytes, false);
                Ok(false)
            }
        }
    }

    fn free_contiguous(&self, allocation: &mut ContiguousAllocation) -> i64 {
        match allocation.release_data() {
            Some(run) => {
                unsafe { dealloc(run.ptr.as_ptr(), Self::page_layout(run.num_pages)) };
                run.byte_size() as i64
            }
            None => 0,
        }
    }

    fn largest_size_class(&self) -> MachinePageCount {
        *self.size_classes.last().unwrap_or(&1)
    }

    fn size_classes(&self) -> &[MachinePageCount] {
        &self.size_classes
    }

    fn kind(&self) -> &str {
        "MALLOC"
    }
}
