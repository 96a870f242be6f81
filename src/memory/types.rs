/*!
 * Memory Types
 * Common types for pool accounting
 */

use crate::core::limits::{DEFAULT_ALIGNMENT, DEFAULT_MEMORY_QUOTA, MAX_ALIGNMENT};
use crate::core::types::Size;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Memory operation result
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Memory errors
///
/// Capacity and allocation failures are recoverable and surfaced to the
/// caller. Structural misuse (duplicate child names, freeing through the
/// wrong pool, destroying a pool with live children) is a bookkeeping
/// invariant violation and panics instead.
#[derive(Error, Debug, Clone)]
pub enum MemoryError {
    #[error("Exceeded memory cap of {} MB", .quota / 1024 / 1024)]
    CapacityExceeded { quota: usize },

    #[error("{op} failed with {size} bytes from {pool}")]
    AllocationFailed {
        pool: String,
        op: &'static str,
        size: usize,
    },
}

impl MemoryError {
    /// Whether the caller may free memory elsewhere and retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, MemoryError::CapacityExceeded { .. })
    }
}

/// Pool kind
///
/// Leaf pools service direct allocation; Aggregate pools organize child
/// pools and roll up usage. Only an Aggregate pool may be a tree root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolKind {
    Leaf,
    Aggregate,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PoolKind::Leaf => write!(f, "LEAF"),
            PoolKind::Aggregate => write!(f, "AGGREGATE"),
        }
    }
}

/// Pool construction options
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Power-of-two alignment applied to every allocation size
    pub alignment: Size,
    /// Capacity passed to the root usage tracker
    pub capacity: usize,
    /// Check for outstanding reserved bytes at pool teardown
    pub leak_check_enabled: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            capacity: DEFAULT_MEMORY_QUOTA,
            leak_check_enabled: false,
        }
    }
}

impl PoolOptions {
    /// Validate alignment: power of two within [word size, MAX_ALIGNMENT]
    pub(crate) fn check_alignment(alignment: Size) {
        assert!(
            alignment.is_power_of_two()
                && alignment >= std::mem::align_of::<usize>()
                && alignment <= MAX_ALIGNMENT,
            "invalid pool alignment: {alignment}"
        );
    }
}

/// Point-in-time pool statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPoolStats {
    pub name: String,
    pub kind: PoolKind,
    pub local_bytes: i64,
    pub local_peak_bytes: i64,
    pub subtree_bytes: i64,
    pub subtree_peak_bytes: i64,
    pub child_count: usize,
}
