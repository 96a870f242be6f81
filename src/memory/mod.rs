/*!
 * Memory Module
 * Hierarchical pool tree, reservation accounting, and raw allocation
 */

pub mod allocator;
pub mod manager;
pub mod pool;
pub mod tracker;
pub mod types;
pub mod usage;

// Re-export for convenience
pub use allocator::{
    Allocation, ContiguousAllocation, MallocAllocator, PageRun, RawAllocator, ReservationFn,
};
pub use manager::{MemoryManager, MemoryManagerOptions};
pub use pool::{DestructionCallback, MemoryPool};
pub use tracker::UsageTracker;
pub use types::{MemoryError, MemoryPoolStats, MemoryResult, PoolKind, PoolOptions};
pub use usage::MemoryUsage;
