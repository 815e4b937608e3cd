//! Storage backends and the Storage Writer
//!
//! Graph and vector stores sit behind the `GraphBackend` and `VectorBackend`
//! traits. `StorageWriter` drives both with per-record upserts and bounded
//! retry. Adapters are selected by name from configuration.

mod embedding;
mod memory;
mod retry;
mod sqlite;
mod sqlite_vec;
mod sqlite_vector;
mod traits;
mod writer;

pub use embedding::{Embedder, EmbeddingError, HashingEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
#[cfg(feature = "embeddings")]
pub use embedding::{FastEmbedEmbedder, FASTEMBED_DIMENSIONS};
pub use memory::{InMemoryGraphStore, InMemoryVectorStore};
pub use retry::{RetryPolicy, Transient};
pub use sqlite::SqliteGraphStore;
#[cfg(feature = "embeddings")]
pub use sqlite_vec::SqliteVecStore;
pub use sqlite_vector::SqliteVectorStore;
pub use traits::{
    EdgeAttributes, GraphBackend, NodeAttributes, OpenStore, StorageError, StorageResult,
    VectorBackend, VectorRecord,
};
pub use writer::{
    entity_from_node, entity_vector_id, relationship_from_edge, relationship_vector_id,
    CommitResult, StorageWriter,
};

/// Graph backend names accepted in configuration
pub const GRAPH_BACKENDS: &[&str] = &["memory", "sqlite"];

/// Vector backend names accepted in configuration
#[cfg(not(feature = "embeddings"))]
pub const VECTOR_BACKENDS: &[&str] = &["memory", "sqlite"];
#[cfg(feature = "embeddings")]
pub const VECTOR_BACKENDS: &[&str] = &["memory", "sqlite", "sqlite-vec"];

/// Embedder names accepted in configuration
#[cfg(not(feature = "embeddings"))]
pub const EMBEDDERS: &[&str] = &["hashing"];
#[cfg(feature = "embeddings")]
pub const EMBEDDERS: &[&str] = &["hashing", "fastembed"];
