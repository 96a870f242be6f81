/*!
 * Memory Manager
 * Process-wide capacity quota and raw allocator ownership
 */

use crate::core::limits::{DEFAULT_ALIGNMENT, DEFAULT_MEMORY_QUOTA};
use crate::core::types::Size;
use crate::memory::allocator::{MallocAllocator, RawAllocator};
use crate::memory::pool::MemoryPool;
use crate::memory::types::{PoolKind, PoolOptions};
use log::info;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Memory manager options
pub struct MemoryManagerOptions {
    /// Byte budget shared by every pool tree under this manager
    pub capacity: Size,
    /// Alignment handed to root pools
    pub alignment: Size,
    /// Check for outstanding reserved bytes at pool teardown
    pub leak_check_enabled: bool,
    /// Raw allocator; defaults to `MallocAllocator`
    pub allocator: Option<Arc<dyn RawAllocator>>,
}

impl Default for MemoryManagerOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MEMORY_QUOTA,
            alignment: DEFAULT_ALIGNMENT,
            leak_check_enabled: false,
            allocator: None,
        }
    }
}

/// Memory manager
///
/// The ultimate gate on total memory usage: every pool reservation is
/// charged against this quota before physical allocation. Shared by the
/// entire pool forest, safe for concurrent reserve/release from
/// arbitrary threads.
pub struct MemoryManager {
    memory_quota: Size,
    alignment: Size,
    leak_check_enabled: bool,
    reserved: AtomicI64,
    allocator: Arc<dyn RawAllocator>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::with_options(MemoryManagerOptions::default())
    }

    /// Create a manager with a custom quota (useful for testing)
    pub fn with_capacity(capacity: Size) -> Self {
        Self::with_options(MemoryManagerOptions {
            capacity,
            ..Default::default()
        })
    }

    pub fn with_options(options: MemoryManagerOptions) -> Self {
        let allocator = options
            .allocator
            .unwrap_or_else(|| Arc::new(MallocAllocator::new()));
        info!(
            "Memory manager initialized with {} bytes quota and {} allocator",
            options.capacity,
            allocator.kind()
        );
        Self {
            memory_quota: options.capacity,
            alignment: options.alignment,
            leak_check_enabled: options.leak_check_enabled,
            reserved: AtomicI64::new(0),
            allocator,
        }
    }

    /// Reserve `size` bytes against the quota; false means the cap was
    /// exceeded.
    ///
    /// A denied reservation leaves the increment in place: the caller
    /// is required to follow up with `release(size)` as part of its
    /// rollback, so the denial path and the normal free path release
    /// through the same code.
    pub fn reserve(&self, size: Size) -> bool {
        let reserved = self.reserved.fetch_add(size as i64, Ordering::SeqCst) + size as i64;
        reserved <= self.memory_quota as i64
    }

    /// Release `size` previously reserved bytes
    pub fn release(&self, size: Size) {
        self.reserved.fetch_sub(size as i64, Ordering::SeqCst);
    }

    pub fn memory_quota(&self) -> Size {
        self.memory_quota
    }

    /// Bytes currently reserved across the whole pool forest
    pub fn reserved_bytes(&self) -> i64 {
        self.reserved.load(Ordering::SeqCst)
    }

    pub fn allocator(&self) -> &Arc<dyn RawAllocator> {
        &self.allocator
    }

    /// Create an Aggregate root pool wired to this manager. The root
    /// tracker is created with the manager's quota as its capacity.
    pub fn get_root_pool(self: &Arc<Self>, name: impl Into<String>) -> Arc<MemoryPool> {
        MemoryPool::create(
            Arc::clone(self),
            name.into(),
            PoolKind::Aggregate,
            None,
            None,
            PoolOptions {
                alignment: self.alignment,
                capacity: self.memory_quota,
                leak_check_enabled: self.leak_check_enabled,
            },
        )
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}
