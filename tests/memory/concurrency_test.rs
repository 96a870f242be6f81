/*!
 * Concurrency Tests
 * Pool tree and accounting under concurrent mutation from many threads
 */

use query_mempool::{MemoryManager, MemoryPool, PoolKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn root_pool(capacity: usize) -> Arc<MemoryPool> {
    Arc::new(MemoryManager::with_capacity(capacity)).get_root_pool("query")
}

#[test]
fn test_visit_children_during_child_churn() {
    let root = root_pool(1 << 24);
    let stop = Arc::new(AtomicBool::new(false));

    let churn: Vec<_> = (0..2)
        .map(|worker| {
            let root = Arc::clone(&root);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut round = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let name = format!("w{worker}-r{round}");
                    let child = root.add_child(name, PoolKind::Leaf);
                    // Child teardown re-enters the parent lock from this
                    // thread while the visitor thread reads it.
                    drop(child);
                    round += 1;
                }
            })
        })
        .collect();

    let visitor = {
        let root = Arc::clone(&root);
        thread::spawn(move || {
            for _ in 0..500 {
                root.visit_children(|child| {
                    // A visited child is fully alive: its name and usage
                    // are readable, never half-destroyed.
                    assert!(!child.name().is_empty());
                    assert!(child.current_bytes() >= 0);
                });
            }
        })
    };

    visitor.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    for handle in churn {
        handle.join().unwrap();
    }
    root.visit_children(|_| panic!("all children should be gone"));
    assert_eq!(root.child_count(), 0);
}

#[test]
fn test_concurrent_allocation_on_one_pool() {
    let root = root_pool(1 << 26);
    let leaf = root.add_child("shared", PoolKind::Leaf);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let leaf = Arc::clone(&leaf);
            thread::spawn(move || {
                for round in 0..200 {
                    let size = 16 + (round % 40) * 16;
                    let ptr = leaf.allocate(size).unwrap();
                    unsafe { leaf.free(ptr, size) };
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(leaf.current_bytes(), 0);
    assert_eq!(leaf.tracker().current_bytes(), 0);
    assert_eq!(root.current_bytes(), 0);
    assert!(leaf.max_bytes() > 0);
}

#[test]
fn test_admitted_reservations_never_exceed_quota() {
    let quota = 1 << 20;
    let manager = Arc::new(MemoryManager::with_capacity(quota));
    let root = manager.get_root_pool("query");
    let block = quota / 2;

    let admitted = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let root = Arc::clone(&root);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                let leaf = root.add_child(format!("w{worker}"), PoolKind::Leaf);
                match leaf.allocate(block) {
                    Ok(ptr) => {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        unsafe { leaf.free(ptr, block) };
                    }
                    Err(err) => assert!(err.is_retriable()),
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Reservation admission is serialized on the quota counter: the set
    // of simultaneously admitted blocks can never sum past the cap.
    assert!(admitted.load(Ordering::SeqCst) >= 1);
    assert_eq!(manager.reserved_bytes(), 0);
    assert_eq!(root.current_bytes(), 0);
}

#[test]
fn test_subtree_aggregates_consistent_after_parallel_churn() {
    let root = root_pool(1 << 26);
    let agg = root.add_child("stage", PoolKind::Aggregate);

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let agg = Arc::clone(&agg);
            thread::spawn(move || {
                let leaf = agg.add_child(format!("op-{worker}"), PoolKind::Leaf);
                let mut live = Vec::new();
                for round in 0..100 {
                    let size = 64 + round;
                    live.push((leaf.allocate(size).unwrap(), size));
                    if round % 3 == 0 {
                        let (ptr, size) = live.swap_remove(0);
                        unsafe { leaf.free(ptr, size) };
                    }
                }
                for (ptr, size) in live {
                    unsafe { leaf.free(ptr, size) };
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(agg.current_bytes(), 0);
    assert_eq!(root.current_bytes(), 0);
    assert_eq!(root.tracker().current_bytes(), 0);
    assert!(root.max_bytes() > 0);
}
