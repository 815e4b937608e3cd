//! Unit failures stay scoped to the unit that failed
//!
//! Run with: `cargo test --test partial_failure`

mod common;

use common::{
    entity, fast_config, isolated_entities, relationship, ws, FailingGraphStore, FlakyGraphStore,
    MockSummarizer, SlowSummarizer,
};
use graphweave::lock::AcquireOptions;
use graphweave::{
    run_merge_job, Backends, CancellationToken, EdgeKey, FailureKind, GraphBackend, LockManager,
    LockSet, MergeConfig, MergeJob, UnitId,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn one_failed_entity_out_of_ten_is_one_failure() {
    let graph = Arc::new(FailingGraphStore::new(&["E3"]));
    let backends = Backends::in_memory().with_graph(graph.clone());
    let workspace = ws("w1");

    let summary = run_merge_job(
        &workspace,
        isolated_entities("E", 10, "c1"),
        Vec::new(),
        &fast_config(),
        &backends,
    )
    .await
    .unwrap();

    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].unit, UnitId::entity("E3"));
    assert_eq!(summary.errors[0].kind, FailureKind::Permanent);
    assert!(!summary.errors[0].retryable);
    assert_eq!(summary.entities_merged, 9);
    assert_eq!(graph.node_count(&workspace).await.unwrap(), 9);
}

#[tokio::test]
async fn failure_inside_a_connected_component_spares_its_neighbours() {
    let graph = Arc::new(FailingGraphStore::new(&["E3"]));
    let backends = Backends::in_memory().with_graph(graph.clone());
    let workspace = ws("w1");
    let relationships = (0..9)
        .map(|i| relationship(&format!("E{}", i), &format!("E{}", i + 1), 1.0, "c1"))
        .collect();

    let summary = run_merge_job(
        &workspace,
        isolated_entities("E", 10, "c1"),
        relationships,
        &fast_config(),
        &backends,
    )
    .await
    .unwrap();

    assert_eq!(summary.stats.partition.component_count, 1);
    let entity_failures: Vec<_> = summary
        .errors
        .iter()
        .filter(|f| matches!(f.unit, UnitId::Entity { .. }))
        .collect();
    assert_eq!(entity_failures.len(), 1);
    assert_eq!(graph.node_count(&workspace).await.unwrap(), 9);
    assert_eq!(summary.components_processed, 1);
}

#[tokio::test]
async fn transient_write_errors_are_retried_away() {
    let graph = Arc::new(FlakyGraphStore::new(2));
    let backends = Backends::in_memory().with_graph(graph.clone());
    let workspace = ws("w1");

    let summary = run_merge_job(
        &workspace,
        vec![entity("A", "PERSON", "a", "c1")],
        Vec::new(),
        &fast_config(),
        &backends,
    )
    .await
    .unwrap();

    assert!(summary.is_clean(), "{:?}", summary.errors);
    assert_eq!(graph.attempts(), 3);
    assert!(graph.get_node(&workspace, "A").await.unwrap().is_some());
}

#[tokio::test]
async fn exhausted_retries_surface_as_retryable_failure() {
    let graph = Arc::new(FlakyGraphStore::new(100));
    let backends = Backends::in_memory().with_graph(graph.clone());
    let config = MergeConfig {
        write_retry_count: 2,
        ..fast_config()
    };

    let summary = run_merge_job(
        &ws("w1"),
        vec![entity("A", "PERSON", "a", "c1")],
        Vec::new(),
        &config,
        &backends,
    )
    .await
    .unwrap();

    assert_eq!(graph.attempts(), 3);
    let retryable = summary.retryable();
    assert_eq!(retryable.len(), 1);
    assert_eq!(retryable[0].unit, UnitId::entity("A"));
    assert_eq!(retryable[0].kind, FailureKind::Transient);
}

#[tokio::test]
async fn failing_summarizer_falls_back_to_joined_fragments() {
    let summarizer = Arc::new(MockSummarizer::failing("model offline"));
    let backends = Backends::in_memory().with_summarizer(summarizer.clone());
    let workspace = ws("w1");
    let config = MergeConfig {
        summarization_threshold: 10,
        ..fast_config()
    };

    let summary = run_merge_job(
        &workspace,
        vec![
            entity("A", "PERSON", "a rather long first description", "c1"),
            entity("A", "PERSON", "a rather long second description", "c2"),
        ],
        Vec::new(),
        &config,
        &backends,
    )
    .await
    .unwrap();

    assert!(summary.is_clean(), "{:?}", summary.errors);
    assert_eq!(summarizer.calls(), 1);
    let a = backends.graph.get_node(&workspace, "A").await.unwrap().unwrap();
    assert!(a.description.contains("first description"));
    assert!(a.description.contains("second description"));
}

#[tokio::test]
async fn held_lock_abandons_only_the_blocked_component() {
    let backends = Backends::in_memory();
    let workspace = ws("w1");
    let blocker = backends
        .locks
        .acquire(
            &LockSet::for_entity(&workspace, "Busy"),
            &AcquireOptions::new(),
        )
        .await
        .unwrap();
    let config = MergeConfig {
        lock_wait_timeout_ms: Some(50),
        ..fast_config()
    };

    let summary = run_merge_job(
        &workspace,
        vec![entity("Busy", "THING", "b", "c1"), entity("Free", "THING", "f", "c1")],
        Vec::new(),
        &config,
        &backends,
    )
    .await
    .unwrap();
    drop(blocker);

    assert_eq!(summary.components_failed, 1);
    assert_eq!(summary.stats.components_abandoned, 1);
    assert_eq!(summary.components_processed, 1);
    assert!(summary
        .errors
        .iter()
        .any(|f| f.unit == UnitId::entity("Busy") && f.kind == FailureKind::LockTimeout));
    assert!(backends.graph.get_node(&workspace, "Free").await.unwrap().is_some());
    assert!(backends.graph.get_node(&workspace, "Busy").await.unwrap().is_none());
}

#[tokio::test]
async fn cancellation_while_waiting_releases_and_reports() {
    let backends = Backends::in_memory();
    let workspace = ws("w1");
    let blocker = backends
        .locks
        .acquire(&LockSet::for_entity(&workspace, "Busy"), &AcquireOptions::new())
        .await
        .unwrap();
    let config = MergeConfig {
        lock_wait_timeout_ms: None,
        ..fast_config()
    };

    let token = CancellationToken::new();
    let job = MergeJob::new(workspace.clone(), config, backends.clone())
        .unwrap()
        .with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        job.run(vec![entity("Busy", "THING", "b", "c1")], Vec::new()),
    )
    .await
    .expect("cancelled job should finish")
    .unwrap();
    canceller.await.unwrap();
    drop(blocker);

    assert!(summary.cancelled);
    assert_eq!(summary.components_failed, 1);
    assert!(summary.errors.iter().any(|f| f.kind == FailureKind::Cancelled));
    assert_eq!(backends.locks.stats().cancellations, 1);
}

#[tokio::test]
async fn timed_out_component_names_its_unfinished_units() {
    let backends =
        Backends::in_memory().with_summarizer(Arc::new(SlowSummarizer::new(Duration::from_secs(10))));
    let workspace = ws("w1");
    let config = MergeConfig {
        summarization_threshold: 20,
        component_timeout_ms: Some(200),
        ..fast_config()
    };

    let summary = run_merge_job(
        &workspace,
        vec![
            entity("A", "PERSON", "short", "c1"),
            entity("B", "PERSON", "a description long enough to need a summary", "c1"),
            entity("C", "PERSON", "short", "c1"),
        ],
        vec![relationship("A", "B", 1.0, "c1"), relationship("B", "C", 1.0, "c1")],
        &config,
        &backends,
    )
    .await
    .unwrap();

    assert_eq!(summary.stats.components_timed_out, 1);
    assert_eq!(summary.components_failed, 1);
    assert_eq!(summary.entities_merged, 1);
    assert_eq!(summary.relationships_merged, 0);

    let mut failed: Vec<UnitId> = summary.errors.iter().map(|f| f.unit.clone()).collect();
    failed.sort_by_key(|u| format!("{:?}", u));
    let mut expected = vec![
        UnitId::entity("B"),
        UnitId::entity("C"),
        UnitId::relationship(&EdgeKey::new("A", "B")),
        UnitId::relationship(&EdgeKey::new("B", "C")),
    ];
    expected.sort_by_key(|u| format!("{:?}", u));
    assert_eq!(failed, expected);
    assert!(summary
        .errors
        .iter()
        .all(|f| f.kind == FailureKind::ComponentTimeout && f.component == Some(0)));
    assert_eq!(summary.retryable().len(), 4);
    assert!(!summary.errors.iter().any(|f| matches!(f.unit, UnitId::Component { .. })));

    assert!(backends.graph.get_node(&workspace, "A").await.unwrap().is_some());
    assert!(backends.graph.get_node(&workspace, "B").await.unwrap().is_none());
}
