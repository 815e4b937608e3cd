//! Overlapping lock sets and concurrent jobs must never deadlock
//!
//! Run with: `cargo test --test lock_ordering`

mod common;

use common::{entity, fast_config, relationship, shared_backends, ws};
use graphweave::lock::{AcquireOptions, LockKey};
use graphweave::{run_merge_job, GraphBackend, InMemoryLockManager, LockManager, LockSet};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

const STRESS_DEADLINE: Duration = Duration::from_secs(20);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reversed_key_orders_resolve_to_the_same_sequence() {
    let workspace = ws("w1");
    let mut forward = LockSet::new();
    forward.insert(LockKey::entity(&workspace, "A"));
    forward.insert(LockKey::entity(&workspace, "B"));
    let mut backward = LockSet::new();
    backward.insert(LockKey::entity(&workspace, "B"));
    backward.insert(LockKey::entity(&workspace, "A"));

    let forward_keys: Vec<&str> = forward.ordered_keys().collect();
    let backward_keys: Vec<&str> = backward.ordered_keys().collect();
    assert_eq!(forward_keys, backward_keys);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_lock_sets_complete_under_contention() {
    let manager = Arc::new(InMemoryLockManager::new());
    let workspace = ws("w1");
    let names = ["A", "B", "C", "D", "E"];

    let mut tasks = JoinSet::new();
    for i in 0..64 {
        let manager = manager.clone();
        let workspace = workspace.clone();
        let mut picked: Vec<&str> = names.to_vec();
        picked.shuffle(&mut rand::thread_rng());
        picked.truncate(2 + i % 3);

        tasks.spawn(async move {
            let mut set = LockSet::new();
            for name in &picked {
                set.insert(LockKey::entity(&workspace, name));
            }
            let guard = manager.acquire(&set, &AcquireOptions::new()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
            drop(guard);
        });
    }

    let drained = tokio::time::timeout(STRESS_DEADLINE, async {
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    })
    .await;
    assert!(drained.is_ok(), "lock acquisition stalled");

    let stats = manager.stats();
    assert_eq!(stats.acquisitions, 64);
    assert_eq!(stats.timeouts, 0);
    assert_eq!(manager.held_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_jobs_over_shared_entities_serialize_their_updates() {
    let backends = shared_backends();
    let workspace = ws("w1");
    let jobs = 12;

    let mut tasks = JoinSet::new();
    for job in 0..jobs {
        let backends = backends.clone();
        let workspace = workspace.clone();
        tasks.spawn(async move {
            let chunk = format!("chunk-{}", job);
            // Alternate endpoint order so half the jobs name the pair reversed.
            let (x, y) = if job % 2 == 0 { ("A", "B") } else { ("B", "A") };
            let entities = vec![
                entity("A", "PERSON", &format!("a from {}", chunk), &chunk),
                entity("B", "PERSON", &format!("b from {}", chunk), &chunk),
                entity("C", "PLACE", "c", &chunk),
            ];
            let relationships = vec![
                relationship(x, y, 1.0, &chunk),
                relationship("B", "C", 0.5, &chunk),
            ];
            run_merge_job(&workspace, entities, relationships, &fast_config(), &backends).await
        });
    }

    let drained = tokio::time::timeout(STRESS_DEADLINE, async {
        while let Some(joined) = tasks.join_next().await {
            let summary = joined.unwrap().unwrap();
            assert!(summary.is_clean(), "{:?}", summary.errors);
        }
    })
    .await;
    assert!(drained.is_ok(), "concurrent jobs stalled");

    let ab = backends.graph.get_edge(&workspace, "A", "B").await.unwrap().unwrap();
    let bc = backends.graph.get_edge(&workspace, "C", "B").await.unwrap().unwrap();
    assert_eq!(ab.weight, jobs as f64);
    assert_eq!(bc.weight, jobs as f64 * 0.5);
    assert_eq!(ab.source_ids.len(), jobs);

    let a = backends.graph.get_node(&workspace, "A").await.unwrap().unwrap();
    assert_eq!(a.description_fragments.len(), jobs);
    assert_eq!(backends.locks.stats().timeouts, 0);
}
