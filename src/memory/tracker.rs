/*!
 * Usage Tracker
 * Hierarchical cumulative byte accounting along a pool ancestor chain
 */

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Hierarchical usage tracker
///
/// One tracker is attached to every accounting pool. A child tracker
/// keeps a strong reference to its parent, and every update propagates
/// to the whole ancestor chain, so a root tracker always reports the
/// cumulative usage of its entire subtree.
///
/// Capacity is recorded on the root for diagnostics; enforcement is the
/// memory manager's job.
#[derive(Debug)]
pub struct UsageTracker {
    parent: Option<Arc<UsageTracker>>,
    is_leaf: bool,
    capacity: Option<i64>,
    current_bytes: AtomicI64,
    peak_bytes: AtomicI64,
    cumulative_bytes: AtomicI64,
    num_allocs: AtomicU64,
}

impl UsageTracker {
    /// Create a root tracker
    pub fn create(capacity: Option<i64>) -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            is_leaf: false,
            capacity,
            current_bytes: AtomicI64::new(0),
            peak_bytes: AtomicI64::new(0),
            cumulative_bytes: AtomicI64::new(0),
            num_allocs: AtomicU64::new(0),
        })
    }

    /// Derive a child tracker for a new pool
    pub fn add_child(self: &Arc<Self>, is_leaf: bool) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(self)),
            is_leaf,
            capacity: None,
            current_bytes: AtomicI64::new(0),
            peak_bytes: AtomicI64::new(0),
            cumulative_bytes: AtomicI64::new(0),
            num_allocs: AtomicU64::new(0),
        })
    }

    /// Adjust usage by `delta`, propagating up the ancestor chain.
    /// Positive deltas count as one allocation on this node.
    pub fn update(&self, delta: i64) {
        if delta > 0 {
            self.cumulative_bytes.fetch_add(delta, Ordering::SeqCst);
            self.num_allocs.fetch_add(1, Ordering::SeqCst);
        }
        let mut node = Some(self);
        while let Some(tracker) = node {
            let current = tracker.current_bytes.fetch_add(delta, Ordering::SeqCst) + delta;
            if delta > 0 {
                tracker.peak_bytes.fetch_max(current, Ordering::SeqCst);
            }
            node = tracker.parent.as_deref();
        }
    }

    pub fn current_bytes(&self) -> i64 {
        self.current_bytes.load(Ordering::SeqCst)
    }

    pub fn peak_bytes(&self) -> i64 {
        self.peak_bytes.load(Ordering::SeqCst)
    }

    /// Total bytes ever reserved through this node
    pub fn cumulative_bytes(&self) -> i64 {
        self.cumulative_bytes.load(Ordering::SeqCst)
    }

    pub fn num_allocs(&self) -> u64 {
        self.num_allocs.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> Option<i64> {
        self.capacity
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }
}
