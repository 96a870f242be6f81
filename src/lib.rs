/*!
 * Query Memory Pool Library
 * Hierarchical memory-pool accounting for query execution
 */

pub mod core;
pub mod memory;

// Re-exports
pub use memory::{
    Allocation, ContiguousAllocation, MallocAllocator, MemoryError, MemoryManager,
    MemoryManagerOptions, MemoryPool, MemoryPoolStats, MemoryResult, MemoryUsage, PoolKind,
    PoolOptions, RawAllocator, UsageTracker,
};
