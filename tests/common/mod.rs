//! Common test utilities for merge job integration tests
//!
//! Batch builders, graph stores that fail on demand (wrapped around the
//! in-memory backend) and scripted summarizers.

#![allow(dead_code)]

pub mod faulty;
pub mod summarizers;

pub use faulty::{FailingGraphStore, FlakyGraphStore};
pub use summarizers::{MockSummarizer, SlowSummarizer};

use graphweave::{Backends, MergeConfig, RawEntity, RawRelationship, Workspace};

pub fn ws(id: &str) -> Workspace {
    Workspace::new(id).unwrap()
}

pub fn entity(name: &str, entity_type: &str, description: &str, source: &str) -> RawEntity {
    RawEntity::new(name, entity_type, description, source)
}

pub fn relationship(source: &str, target: &str, weight: f64, chunk: &str) -> RawRelationship {
    RawRelationship::new(source, target, weight)
        .with_description(format!("{} relates to {}", source, target))
        .with_keywords("related")
        .with_source_id(chunk)
}

/// Small retry delays so failure tests run quickly
pub fn fast_config() -> MergeConfig {
    MergeConfig {
        write_retry_backoff_ms: 1,
        max_write_retry_backoff_ms: 5,
        lock_wait_timeout_ms: Some(5_000),
        ..MergeConfig::default()
    }
}

/// Shared in-memory stores and lock manager
pub fn shared_backends() -> Backends {
    Backends::in_memory()
}

/// `count` entities named `{prefix}{i}`, each in its own component
pub fn isolated_entities(prefix: &str, count: usize, source: &str) -> Vec<RawEntity> {
    (0..count)
        .map(|i| entity(&format!("{}{}", prefix, i), "THING", &format!("item {}", i), source))
        .collect()
}
