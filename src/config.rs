//! Job configuration
//!
//! Loaded from YAML; every field has a default, so an empty file (or no
//! file) is a valid configuration. Durations are in milliseconds.
//!
//! ```yaml
//! merge:
//!   max_concurrent_components: 4
//!   summarization_threshold: 1500
//!   lock_wait_timeout_ms: 10000
//! storage:
//!   graph_backend: sqlite
//!   graph_path: /var/lib/graphweave/graph.db
//! ```

use crate::merge::MergeSettings;
use crate::storage::{RetryPolicy, EMBEDDERS, GRAPH_BACKENDS, VECTOR_BACKENDS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Lock manager names accepted in configuration
pub const LOCK_BACKENDS: &[&str] = &["memory", "sqlite"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unknown {kind} backend '{name}' (expected one of: {expected})")]
    UnknownBackend {
        kind: &'static str,
        name: String,
        expected: String,
    },

    #[error("failed to open storage: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("failed to open lock table: {0}")]
    Lock(#[from] crate::lock::LockError),

    #[error("failed to load embedder: {0}")]
    Embedding(#[from] crate::storage::EmbeddingError),
}

/// Merge tuning: the recognized job options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Components merged at once per job
    pub max_concurrent_components: usize,
    /// Joined description length (characters) above which the summarizer runs
    pub summarization_threshold: usize,
    /// Length requested from the summarizer
    pub summary_max_length: usize,
    /// Wait for a unit's lock set; `null` waits indefinitely
    pub lock_wait_timeout_ms: Option<u64>,
    /// Extra attempts after a transient write error
    pub write_retry_count: u32,
    /// First backoff delay; doubles per attempt
    pub write_retry_backoff_ms: u64,
    pub max_write_retry_backoff_ms: u64,
    /// Time budget per component; `null` disables it
    pub component_timeout_ms: Option<u64>,
    pub summarizer_timeout_ms: u64,
    /// Summarizer calls in flight per job; `null` is unbounded
    pub summarizer_concurrency: Option<usize>,
    /// Record writes in flight per job; `null` is unbounded
    pub storage_concurrency: Option<usize>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_components: 8,
            summarization_threshold: 2000,
            summary_max_length: 800,
            lock_wait_timeout_ms: Some(30_000),
            write_retry_count: 3,
            write_retry_backoff_ms: 100,
            max_write_retry_backoff_ms: 5_000,
            component_timeout_ms: Some(300_000),
            summarizer_timeout_ms: 60_000,
            summarizer_concurrency: None,
            storage_concurrency: None,
        }
    }
}

impl MergeConfig {
    pub fn lock_wait_timeout(&self) -> Option<Duration> {
        self.lock_wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn component_timeout(&self) -> Option<Duration> {
        self.component_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.write_retry_count,
            initial_backoff: Duration::from_millis(self.write_retry_backoff_ms),
            max_backoff: Duration::from_millis(self.max_write_retry_backoff_ms),
            multiplier: 2.0,
        }
    }

    pub fn merge_settings(&self) -> MergeSettings {
        MergeSettings {
            summarization_threshold: self.summarization_threshold,
            summary_max_length: self.summary_max_length,
            summarizer_timeout: Duration::from_millis(self.summarizer_timeout_ms),
            lock_wait_timeout: self.lock_wait_timeout(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_components == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_components must be at least 1".to_string(),
            ));
        }
        if self.summary_max_length == 0 {
            return Err(ConfigError::Invalid(
                "summary_max_length must be at least 1".to_string(),
            ));
        }
        if self.write_retry_backoff_ms > self.max_write_retry_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "write_retry_backoff_ms ({}) exceeds max_write_retry_backoff_ms ({})",
                self.write_retry_backoff_ms, self.max_write_retry_backoff_ms
            )));
        }
        if self.lock_wait_timeout_ms == Some(0) || self.component_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "timeouts must be positive or null".to_string(),
            ));
        }
        if self.summarizer_concurrency == Some(0) || self.storage_concurrency == Some(0) {
            return Err(ConfigError::Invalid(
                "concurrency limits must be positive or null".to_string(),
            ));
        }
        for (field, limit) in [
            ("max_concurrent_components", Some(self.max_concurrent_components)),
            ("summarizer_concurrency", self.summarizer_concurrency),
            ("storage_concurrency", self.storage_concurrency),
        ] {
            if limit.is_some_and(|n| n > Semaphore::MAX_PERMITS) {
                return Err(ConfigError::Invalid(format!(
                    "{} exceeds the maximum of {}",
                    field,
                    Semaphore::MAX_PERMITS
                )));
            }
        }
        Ok(())
    }

    /// A lease must outlive every component that can hold it. With no
    /// component budget nothing bounds how long a lock is held.
    pub fn check_lease(&self, lease: Duration) -> Result<(), ConfigError> {
        match self.component_timeout() {
            Some(budget) if budget <= lease => Ok(()),
            Some(budget) => Err(ConfigError::Invalid(format!(
                "lock lease ({:?}) is shorter than component_timeout_ms ({:?})",
                lease, budget
            ))),
            None => Err(ConfigError::Invalid(
                "a leased lock table requires component_timeout_ms".to_string(),
            )),
        }
    }
}

/// External summarizer command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Program to run; unset disables summarization
    pub command: Option<String>,
    pub args: Vec<String>,
}

/// Backend selection by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub graph_backend: String,
    pub graph_path: Option<PathBuf>,
    pub vector_backend: String,
    pub vector_path: Option<PathBuf>,
    pub lock_backend: String,
    pub lock_path: Option<PathBuf>,
    /// Lease on rows in a shared lock table; must cover component_timeout_ms
    pub lock_lease_ms: u64,
    /// `hashing`, or `fastembed` with the `embeddings` feature
    pub embedder: String,
    /// Vector length for the hashing embedder; model embedders fix their own
    pub embedding_dimensions: usize,
    pub summarizer: SummarizerConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            graph_backend: "memory".to_string(),
            graph_path: None,
            vector_backend: "memory".to_string(),
            vector_path: None,
            lock_backend: "memory".to_string(),
            lock_path: None,
            lock_lease_ms: 600_000,
            embedder: "hashing".to_string(),
            embedding_dimensions: crate::storage::DEFAULT_EMBEDDING_DIMENSIONS,
            summarizer: SummarizerConfig::default(),
        }
    }
}

fn check_name(kind: &'static str, name: &str, known: &[&str]) -> Result<(), ConfigError> {
    if known.contains(&name) {
        Ok(())
    } else {
        Err(ConfigError::UnknownBackend {
            kind,
            name: name.to_string(),
            expected: known.join(", "),
        })
    }
}

impl StorageConfig {
    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    /// Verify every backend name is known and file-backed ones have a path
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_name("graph", &self.graph_backend, GRAPH_BACKENDS)?;
        check_name("vector", &self.vector_backend, VECTOR_BACKENDS)?;
        check_name("lock", &self.lock_backend, LOCK_BACKENDS)?;
        check_name("embedder", &self.embedder, EMBEDDERS)?;
        if self.lock_lease_ms == 0 {
            return Err(ConfigError::Invalid(
                "lock_lease_ms must be at least 1".to_string(),
            ));
        }
        if self.embedding_dimensions == 0 {
            return Err(ConfigError::Invalid(
                "embedding_dimensions must be at least 1".to_string(),
            ));
        }
        if self.lock_backend == "sqlite" && self.lock_path.is_none() {
            return Err(ConfigError::Invalid(
                "lock_backend 'sqlite' requires lock_path".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphweaveConfig {
    pub merge: MergeConfig,
    pub storage: StorageConfig,
}

impl GraphweaveConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes as unit, not as an empty map.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.merge.validate()?;
        self.storage.validate()?;
        if self.storage.lock_backend == "sqlite" {
            self.merge.check_lease(self.storage.lock_lease())?;
        }
        Ok(())
    }
}
