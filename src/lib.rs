//! Graphweave: concurrent merge engine for extracted knowledge graphs
//!
//! Takes a batch of raw entity and relationship records produced by an
//! extraction step and folds them into persistent graph and vector stores,
//! deduplicating and aggregating against what is already stored.
//!
//! # Core Concepts
//!
//! - **Workspace**: isolation scope; every record, lock key, and stored row
//!   carries one
//! - **Component**: a connected piece of the batch's entity graph, merged as
//!   an independent unit of parallel work
//! - **Lock set**: workspace-scoped keys acquired in sorted order so
//!   concurrent jobs never deadlock
//! - **Unit failure**: one entity or relationship that failed; reported by
//!   name, never fatal to the job
//!
//! # Example
//!
//! ```
//! use graphweave::{run_merge_job, Backends, MergeConfig, RawEntity, Workspace};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let workspace = Workspace::new("tenant-a").unwrap();
//! let entities = vec![RawEntity::new("Alice", "PERSON", "an engineer", "chunk-1")];
//! let summary = run_merge_job(
//!     &workspace,
//!     entities,
//!     Vec::new(),
//!     &MergeConfig::default(),
//!     &Backends::in_memory(),
//! )
//! .await
//! .unwrap();
//! assert_eq!(summary.entities_merged, 1);
//! # });
//! ```

pub mod cancel;
pub mod config;
mod graph;
pub mod job;
pub mod lock;
pub mod merge;
pub mod outcome;
pub mod partition;
pub mod storage;

pub use cancel::CancellationToken;
pub use config::{ConfigError, GraphweaveConfig, MergeConfig, StorageConfig};
pub use graph::{
    EdgeKey, GraphError, MergedEntity, MergedRelationship, RawBatch, RawEntity, RawRelationship,
    Workspace, GRAPH_FIELD_SEP, UNKNOWN_ENTITY_TYPE,
};
pub use job::{run_merge_job, Backends, JobError, JobStats, JobSummary, MergeJob};
pub use lock::{InMemoryLockManager, LockError, LockManager, LockSet, SqliteLockManager};
pub use merge::{MergeEngine, MergeResult, MergeSettings, Summarizer};
pub use outcome::{FailureKind, UnitFailure, UnitId};
pub use partition::{partition, partition_batch, ConnectedComponent};
pub use storage::{GraphBackend, StorageError, StorageResult, StorageWriter, VectorBackend};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
