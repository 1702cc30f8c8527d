//! Integration tests for the concurrency kernel
//!
//! These tests verify:
//! - DedupQueue against a simple model (property based)
//! - Mutual exclusion and idle eviction of named resources under contention
//! - Concurrent producers collapsing into one pending entry per key

use projkeeper::concurrency::{DedupQueue, HolderId, ResourceRegistry};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Enqueue(u8, u32),
    Dequeue,
    Clear,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..5, any::<u32>()).prop_map(|(k, v)| Op::Enqueue(k, v)),
        2 => Just(Op::Dequeue),
        1 => Just(Op::Clear),
    ]
}

proptest! {
    #[test]
    fn dedup_queue_matches_model(ops in prop::collection::vec(op(), 0..64)) {
        let queue = DedupQueue::new();
        // Pending entries in first-insertion order
        let mut model: Vec<(u8, u32)> = Vec::new();

        for op in ops {
            match op {
                Op::Enqueue(key, value) => {
                    let replaced = queue.enqueue(key, value);
                    match model.iter_mut().find(|(k, _)| *k == key) {
                        Some(entry) => {
                            prop_assert!(replaced);
                            entry.1 = value;
                        }
                        None => {
                            prop_assert!(!replaced);
                            model.push((key, value));
                        }
                    }
                }
                Op::Dequeue => {
                    let expected = if model.is_empty() { None } else { Some(model.remove(0)) };
                    prop_assert_eq!(queue.try_dequeue(), expected);
                }
                Op::Clear => {
                    prop_assert_eq!(queue.clear(), model.len());
                    model.clear();
                }
            }
            prop_assert_eq!(queue.count(), model.len());
            for (key, _) in &model {
                prop_assert!(queue.contains_key(key));
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_named_resource_is_exclusive_under_contention() {
    let registry = Arc::new(ResourceRegistry::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let entered = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = Arc::clone(&registry);
        let inside = Arc::clone(&inside);
        let entered = Arc::clone(&entered);
        tasks.push(tokio::spawn(async move {
            let lease = registry.lease("app/CheckStatus", None).await.unwrap();
            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
            tokio::time::sleep(Duration::from_millis(2)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            entered.fetch_add(1, Ordering::SeqCst);
            drop(lease);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(entered.load(Ordering::SeqCst), 16);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_timed_out_waiter_does_not_pin_resource() {
    let registry = Arc::new(ResourceRegistry::new());
    let owner = HolderId::next();
    assert!(registry.acquire("shared", owner, None).await);

    let waiter = HolderId::next();
    assert!(
        !registry
            .acquire("shared", waiter, Some(Duration::from_millis(10)))
            .await
    );
    // A stranger's release is ignored
    registry.release("shared", waiter);
    assert!(registry.is_held("shared"));

    registry.release("shared", owner);
    assert!(!registry.is_held("shared"));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_distinct_names_do_not_block_each_other() {
    let registry = Arc::new(ResourceRegistry::new());
    let first = registry.lease("a", None).await.unwrap();
    let second = registry
        .lease("b", Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert_eq!(registry.len(), 2);
    assert_ne!(first.holder(), second.holder());

    drop(first);
    assert_eq!(registry.len(), 1);
    drop(second);
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_collapse_per_key() {
    let queue = Arc::new(DedupQueue::new());
    let mut producers = Vec::new();
    for producer in 0..8u32 {
        let queue = Arc::clone(&queue);
        producers.push(tokio::spawn(async move {
            for round in 0..100u32 {
                queue.enqueue(round % 4, producer * 1000 + round);
                tokio::task::yield_now().await;
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    assert_eq!(queue.count(), 4);
    let mut keys = Vec::new();
    while let Some((key, value)) = queue.try_dequeue() {
        assert_eq!(value % 1000 % 4, key);
        keys.push(key);
    }
    keys.sort();
    assert_eq!(keys, vec![0, 1, 2, 3]);
}
