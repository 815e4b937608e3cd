//! The external collaborators a job is wired to

use crate::config::{ConfigError, MergeConfig, StorageConfig};
use crate::lock::{InMemoryLockManager, LockManager, SqliteLockManager};
use crate::merge::{CommandSummarizer, NoopSummarizer, Summarizer};
use crate::storage::{
    Embedder, GraphBackend, HashingEmbedder, InMemoryGraphStore, InMemoryVectorStore, OpenStore,
    SqliteGraphStore, SqliteVectorStore, VectorBackend, EMBEDDERS, GRAPH_BACKENDS,
    VECTOR_BACKENDS,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Handles to every backend a job uses
///
/// Cheap to clone. The lock manager is the one piece meant to be shared
/// between jobs; everything a job mutates in memory is built per run.
#[derive(Clone)]
pub struct Backends {
    pub graph: Arc<dyn GraphBackend>,
    pub vector: Arc<dyn VectorBackend>,
    pub embedder: Arc<dyn Embedder>,
    pub summarizer: Arc<dyn Summarizer>,
    pub locks: Arc<dyn LockManager>,
}

fn require_path<'a>(
    kind: &str,
    path: &'a Option<std::path::PathBuf>,
) -> Result<&'a Path, ConfigError> {
    path.as_deref().ok_or_else(|| {
        ConfigError::Invalid(format!("{} backend 'sqlite' requires a path", kind))
    })
}

impl Backends {
    /// Everything in memory, no summarizer
    pub fn in_memory() -> Self {
        Self {
            graph: Arc::new(InMemoryGraphStore::new()),
            vector: Arc::new(InMemoryVectorStore::new()),
            embedder: Arc::new(HashingEmbedder::default()),
            summarizer: Arc::new(NoopSummarizer),
            locks: Arc::new(InMemoryLockManager::new()),
        }
    }

    /// Open the backends named in configuration
    pub fn from_config(storage: &StorageConfig, merge: &MergeConfig) -> Result<Self, ConfigError> {
        storage.validate()?;

        let embedder: Arc<dyn Embedder> = match storage.embedder.as_str() {
            "hashing" => Arc::new(HashingEmbedder::new(storage.embedding_dimensions)),
            #[cfg(feature = "embeddings")]
            "fastembed" => Arc::new(crate::storage::FastEmbedEmbedder::default_model()?),
            other => {
                return Err(ConfigError::UnknownBackend {
                    kind: "embedder",
                    name: other.to_string(),
                    expected: EMBEDDERS.join(", "),
                })
            }
        };

        let graph: Arc<dyn GraphBackend> = match storage.graph_backend.as_str() {
            "memory" => Arc::new(InMemoryGraphStore::new()),
            "sqlite" => Arc::new(SqliteGraphStore::open(require_path(
                "graph",
                &storage.graph_path,
            )?)?),
            other => {
                return Err(ConfigError::UnknownBackend {
                    kind: "graph",
                    name: other.to_string(),
                    expected: GRAPH_BACKENDS.join(", "),
                })
            }
        };

        let vector: Arc<dyn VectorBackend> = match storage.vector_backend.as_str() {
            "memory" => Arc::new(InMemoryVectorStore::new()),
            "sqlite" => Arc::new(SqliteVectorStore::open(require_path(
                "vector",
                &storage.vector_path,
            )?)?),
            #[cfg(feature = "embeddings")]
            "sqlite-vec" => Arc::new(crate::storage::SqliteVecStore::open(
                require_path("vector", &storage.vector_path)?,
                embedder.dimensions(),
            )?),
            other => {
                return Err(ConfigError::UnknownBackend {
                    kind: "vector",
                    name: other.to_string(),
                    expected: VECTOR_BACKENDS.join(", "),
                })
            }
        };

        let locks: Arc<dyn LockManager> = match storage.lock_backend.as_str() {
            "sqlite" => {
                merge.check_lease(storage.lock_lease())?;
                Arc::new(SqliteLockManager::open(
                    require_path("lock", &storage.lock_path)?,
                    storage.lock_lease(),
                )?)
            }
            _ => Arc::new(InMemoryLockManager::new()),
        };

        let summarizer: Arc<dyn Summarizer> = match &storage.summarizer.command {
            Some(command) => Arc::new(CommandSummarizer::new(
                command.clone(),
                storage.summarizer.args.clone(),
                Duration::from_millis(merge.summarizer_timeout_ms),
            )),
            None => Arc::new(NoopSummarizer),
        };

        tracing::debug!(
            graph = graph.name(),
            vector = vector.name(),
            locks = locks.name(),
            embedder = embedder.name(),
            summarizer = summarizer.id(),
            "backends opened"
        );

        Ok(Self {
            graph,
            vector,
            embedder,
            summarizer,
            locks,
        })
    }

    pub fn with_graph(mut self, graph: Arc<dyn GraphBackend>) -> Self {
        self.graph = graph;
        self
    }

    pub fn with_vector(mut self, vector: Arc<dyn VectorBackend>) -> Self {
        self.vector = vector;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_opens_in_memory_backends() {
        let backends = Backends::from_config(&StorageConfig::default(), &MergeConfig::default())
            .unwrap();
        assert_eq!(backends.graph.name(), "memory");
        assert_eq!(backends.locks.name(), "memory");
        assert_eq!(backends.summarizer.id(), "noop");
    }

    #[test]
    fn sqlite_backends_open_at_configured_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            graph_backend: "sqlite".to_string(),
            graph_path: Some(dir.path().join("graph.db")),
            vector_backend: "sqlite".to_string(),
            vector_path: Some(dir.path().join("vectors.db")),
            lock_backend: "sqlite".to_string(),
            lock_path: Some(dir.path().join("locks.db")),
            ..StorageConfig::default()
        };
        let backends = Backends::from_config(&storage, &MergeConfig::default()).unwrap();
        assert_eq!(backends.graph.name(), "sqlite");
        assert_eq!(backends.vector.name(), "sqlite");
        assert_eq!(backends.locks.name(), "sqlite");
        assert!(dir.path().join("graph.db").exists());
    }

    #[test]
    fn sqlite_graph_without_path_is_invalid() {
        let storage = StorageConfig {
            graph_backend: "sqlite".to_string(),
            ..StorageConfig::default()
        };
        let err = Backends::from_config(&storage, &MergeConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn configured_dimensions_size_the_hashing_embedder() {
        let storage = StorageConfig {
            embedding_dimensions: 32,
            ..StorageConfig::default()
        };
        let backends = Backends::from_config(&storage, &MergeConfig::default()).unwrap();
        assert_eq!(backends.embedder.name(), "hashing");
        assert_eq!(backends.embedder.dimensions(), 32);
    }

    #[cfg(not(feature = "embeddings"))]
    #[test]
    fn fastembed_needs_the_embeddings_feature() {
        let storage = StorageConfig {
            embedder: "fastembed".to_string(),
            ..StorageConfig::default()
        };
        let err = Backends::from_config(&storage, &MergeConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::UnknownBackend { kind: "embedder", .. }));
    }

    #[cfg(feature = "embeddings")]
    #[test]
    fn sqlite_vec_store_takes_the_embedder_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            vector_backend: "sqlite-vec".to_string(),
            vector_path: Some(dir.path().join("vec.db")),
            embedding_dimensions: 16,
            ..StorageConfig::default()
        };
        let backends = Backends::from_config(&storage, &MergeConfig::default()).unwrap();
        assert_eq!(backends.vector.name(), "sqlite-vec");
        assert!(dir.path().join("vec.db").exists());
    }

    #[test]
    fn short_lock_lease_is_rejected_for_a_shared_table() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            lock_backend: "sqlite".to_string(),
            lock_path: Some(dir.path().join("locks.db")),
            lock_lease_ms: 1_000,
            ..StorageConfig::default()
        };
        let merge = MergeConfig {
            component_timeout_ms: Some(5_000),
            ..MergeConfig::default()
        };
        let err = Backends::from_config(&storage, &merge).err().unwrap();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let merge = MergeConfig {
            component_timeout_ms: Some(1_000),
            ..MergeConfig::default()
        };
        assert!(Backends::from_config(&storage, &merge).is_ok());
    }

    #[test]
    fn unknown_vector_backend_is_rejected() {
        let storage = StorageConfig {
            vector_backend: "qdrant".to_string(),
            ..StorageConfig::default()
        };
        let err = Backends::from_config(&storage, &MergeConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::UnknownBackend { kind: "vector", .. }));
    }
}
