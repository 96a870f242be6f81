/*!
 * Memory Pool
 *
 * A named node in the accounting tree representing one memory consumer
 * or consumer group. Aggregate pools organize children and roll up
 * usage; Leaf pools service direct allocation (see `alloc.rs`).
 *
 * ## Ownership
 *
 * A child holds a strong reference to its parent, so a parent outlives
 * every child. A parent holds only a name-to-weak-handle lookup of its
 * children: the tree never keeps a child alive, ownership stays with
 * the pool's creator. An expired weak entry means "child already gone"
 * and is skipped, not an error.
 */

mod alloc;

use crate::core::limits::MIN_PREFERRED_SIZE;
use crate::core::types::{MachinePageCount, Size};
use crate::memory::allocator::RawAllocator;
use crate::memory::manager::MemoryManager;
use crate::memory::tracker::UsageTracker;
use crate::memory::types::{MemoryPoolStats, PoolKind, PoolOptions};
use crate::memory::usage::MemoryUsage;
use ahash::RandomState;
use log::error;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Callback invoked when a pool is destroyed
pub type DestructionCallback = Box<dyn Fn(&MemoryPool) + Send + Sync>;

/// Hierarchical accounting pool
pub struct MemoryPool {
    name: String,
    kind: PoolKind,
    alignment: Size,
    parent: Option<Arc<MemoryPool>>,
    children: RwLock<HashMap<String, Weak<MemoryPool>, RandomState>>,
    tracker: Arc<UsageTracker>,
    manager: Arc<MemoryManager>,
    /// Bytes this pool allocated directly
    local_usage: MemoryUsage,
    /// Bytes aggregated from descendants, maintained incrementally
    subtree_usage: MemoryUsage,
    leak_check_enabled: bool,
    destruction_cb: Option<DestructionCallback>,
}

impl MemoryPool {
    pub(crate) fn create(
        manager: Arc<MemoryManager>,
        name: String,
        kind: PoolKind,
        parent: Option<Arc<MemoryPool>>,
        destruction_cb: Option<DestructionCallback>,
        options: PoolOptions,
    ) -> Arc<Self> {
        PoolOptions::check_alignment(options.alignment);
        assert!(
            parent.is_some() || kind == PoolKind::Aggregate,
            "root memory pool {name} must be an aggregate pool"
        );
        let tracker = match &parent {
            None => UsageTracker::create(Some(options.capacity as i64)),
            Some(parent) => parent.tracker.add_child(kind == PoolKind::Leaf),
        };
        Arc::new(Self {
            name,
            kind,
            alignment: options.alignment,
            parent,
            children: RwLock::new(HashMap::with_hasher(RandomState::new())),
            tracker,
            manager,
            local_usage: MemoryUsage::new(),
            subtree_usage: MemoryUsage::new(),
            leak_check_enabled: options.leak_check_enabled,
            destruction_cb,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn alignment(&self) -> Size {
        self.alignment
    }

    pub fn parent(&self) -> Option<&Arc<MemoryPool>> {
        self.parent.as_ref()
    }

    pub fn tracker(&self) -> &Arc<UsageTracker> {
        &self.tracker
    }

    pub(crate) fn raw_allocator(&self) -> &dyn RawAllocator {
        self.manager.allocator().as_ref()
    }

    pub(crate) fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    /// Construct a new child pool registered under `name`.
    ///
    /// The returned strong reference is the only thing keeping the
    /// child alive; the parent records just a weak handle. Panics if
    /// `name` already exists among current children.
    pub fn add_child(self: &Arc<Self>, name: impl Into<String>, kind: PoolKind) -> Arc<Self> {
        self.add_child_with_callback(name, kind, None)
    }

    /// `add_child` with a destruction callback run at child teardown
    pub fn add_child_with_callback(
        self: &Arc<Self>,
        name: impl Into<String>,
        kind: PoolKind,
        destruction_cb: Option<DestructionCallback>,
    ) -> Arc<Self> {
        self.check_pool_management();
        let name = name.into();

        let mut children = self.children.write();
        assert!(
            !children.contains_key(&name),
            "child memory pool {name} already exists in {self}"
        );
        let child = Self::create(
            Arc::clone(&self.manager),
            name.clone(),
            kind,
            Some(Arc::clone(self)),
            destruction_cb,
            PoolOptions {
                alignment: self.alignment,
                capacity: 0,
                leak_check_enabled: self.leak_check_enabled,
            },
        );
        children.insert(name, Arc::downgrade(&child));
        child
    }

    /// Deregister a child by name. Invoked from child teardown; a
    /// missing entry means the bookkeeping already diverged.
    fn drop_child(&self, name: &str) {
        self.check_pool_management();

        let mut children = self.children.write();
        assert!(
            children.remove(name).is_some(),
            "child memory pool {name} doesn't exist in {self}"
        );
    }

    /// Invoke `visitor` once per currently-live child.
    ///
    /// Live children are snapshotted under the read lock and the lock is
    /// released before any callback runs: the visitor may inspect this
    /// pool again, and if its strong reference turns out to be the last
    /// one, dropping it triggers child teardown which re-enters this
    /// pool's children lock through `drop_child`.
    pub fn visit_children(&self, mut visitor: impl FnMut(&Arc<MemoryPool>)) {
        let live: Vec<Arc<MemoryPool>> = {
            let children = self.children.read();
            children.values().filter_map(Weak::upgrade).collect()
        };
        for child in &live {
            visitor(child);
        }
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Round a requested size up to an allocation-friendly size.
    ///
    /// Sizes below 8 become 8 and powers of two are returned unchanged.
    /// Otherwise, a size within 1.5x of the previous power of two rounds
    /// to 1.5x that power, else to the next power of two. This policy is
    /// independent of the raw allocator's own size classes.
    pub fn preferred_size(size: Size) -> Size {
        if size < MIN_PREFERRED_SIZE {
            return MIN_PREFERRED_SIZE;
        }
        let lower = 1usize << (usize::BITS - 1 - size.leading_zeros());
        if lower == size {
            return size;
        }
        if lower + lower / 2 >= size {
            return lower + lower / 2;
        }
        lower * 2
    }

    /// Point-in-time statistics snapshot
    pub fn stats(&self) -> MemoryPoolStats {
        MemoryPoolStats {
            name: self.name.clone(),
            kind: self.kind,
            local_bytes: self.local_usage.current_bytes(),
            local_peak_bytes: self.local_usage.max_bytes(),
            subtree_bytes: self.subtree_usage.current_bytes(),
            subtree_peak_bytes: self.subtree_usage.max_bytes(),
            child_count: self.child_count(),
        }
    }

    pub(crate) fn local_usage(&self) -> &MemoryUsage {
        &self.local_usage
    }

    pub(crate) fn subtree_usage(&self) -> &MemoryUsage {
        &self.subtree_usage
    }

    /// Structural mutation is an Aggregate-only capability
    fn check_pool_management(&self) {
        assert!(
            self.kind == PoolKind::Aggregate,
            "pool management attempted on {self}"
        );
    }

    /// Direct allocation is a Leaf-only capability
    pub(crate) fn check_memory_allocation(&self) {
        assert!(
            self.kind == PoolKind::Leaf,
            "direct allocation attempted on {self}"
        );
    }

    pub fn largest_size_class(&self) -> MachinePageCount {
        self.raw_allocator().largest_size_class()
    }

    pub fn size_classes(&self) -> &[MachinePageCount] {
        self.manager.allocator().size_classes()
    }
}

impl std::fmt::Display for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Memory Pool[{} {} {}]",
            self.name,
            self.kind,
            self.raw_allocator().kind()
        )
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("alignment", &self.alignment)
            .field("child_count", &self.child_count())
            .finish()
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        // Callers destroy children before parents; auto-cleanup would
        // hide ownership bugs. Skipped while unwinding: a double panic
        // would abort.
        if !std::thread::panicking() {
            let child_count = self.children.get_mut().len();
            assert!(
                child_count == 0,
                "memory pool {} destroyed with {} live children",
                self.name,
                child_count
            );
        }

        if let Some(cb) = self.destruction_cb.take() {
            cb(self);
        }

        if let Some(parent) = &self.parent {
            parent.drop_child(&self.name);
        }

        // After deregistration so a leak report leaves the tree sound
        if self.leak_check_enabled {
            let remaining_bytes = self.tracker.current_bytes();
            if remaining_bytes != 0 {
                error!(
                    "Memory leak in pool {}: {} bytes still allocated",
                    self.name, remaining_bytes
                );
                if !std::thread::panicking() {
                    panic!(
                        "memory pool {} should be destroyed only after all allocated memory has \
                         been freed. Remaining bytes allocated: {}, cumulative bytes allocated: \
                         {}, number of allocations: {}",
                        self.name,
                        remaining_bytes,
                        self.tracker.cumulative_bytes(),
                        self.tracker.num_allocs()
                    );
                }
            }
        }
    }
}
