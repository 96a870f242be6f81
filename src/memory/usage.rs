/*!
 * Usage Counters
 * Current and high-water byte counts for one accounting node
 */

use std::sync::atomic::{AtomicI64, Ordering};

/// Current/peak byte counters for one pool
///
/// Pools keep two of these: one for bytes the pool allocated directly
/// (local) and one for bytes aggregated from its descendants (subtree).
/// Counters are atomic so concurrent allocation on one pool stays
/// consistent; the high-water mark is monotonically non-decreasing.
#[derive(Debug, Default)]
pub struct MemoryUsage {
    current_bytes: AtomicI64,
    max_bytes: AtomicI64,
}

impl MemoryUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjust current bytes by `delta` (positive or negative) and return
    /// the new value. Raises the high-water mark when exceeded.
    pub fn increment(&self, delta: i64) -> i64 {
        let current = self.current_bytes.fetch_add(delta, Ordering::SeqCst) + delta;
        if delta > 0 {
            self.max_bytes.fetch_max(current, Ordering::SeqCst);
        }
        current
    }

    pub fn current_bytes(&self) -> i64 {
        self.current_bytes.load(Ordering::SeqCst)
    }

    pub fn max_bytes(&self) -> i64 {
        self.max_bytes.load(Ordering::SeqCst)
    }
}
