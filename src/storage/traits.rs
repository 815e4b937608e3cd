//! Backend trait definitions

use crate::graph::Workspace;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),
}

impl StorageError {
    /// Whether retrying the same write may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::ConnectionReset(_) | Self::Unavailable(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Attributes stored on a graph node, keyed by `(workspace, name)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub entity_type: String,
    pub description: String,
    #[serde(default)]
    pub description_fragments: Vec<String>,
    #[serde(default)]
    pub source_ids: Vec<String>,
    #[serde(default)]
    pub file_paths: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes stored on a graph edge, keyed by `(workspace, a, b)` normalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeAttributes {
    /// Endpoint order as first stored
    pub source_name: String,
    pub target_name: String,
    pub description: String,
    #[serde(default)]
    pub description_fragments: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub weight: f64,
    #[serde(default)]
    pub weight_contributions: BTreeMap<String, f64>,
    #[serde(default)]
    pub source_ids: Vec<String>,
    #[serde(default)]
    pub file_paths: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// A stored vector record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub workspace: Workspace,
    pub embedding: Vec<f32>,
    pub text: String,
}

/// Reject names the backends cannot key on
pub(crate) fn validate_key(workspace: &Workspace, parts: &[&str]) -> StorageResult<()> {
    if workspace.as_str().is_empty() {
        return Err(StorageError::Validation("empty workspace".to_string()));
    }
    if parts.iter().any(|p| p.trim().is_empty()) {
        return Err(StorageError::Validation(format!(
            "empty key component in {:?}",
            parts
        )));
    }
    Ok(())
}

/// Graph storage backend
///
/// Every operation is an independent upsert or lookup scoped to one
/// workspace. Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Short name for logs and failure reports
    fn name(&self) -> &str;

    /// Cheap reachability check run before a job starts
    async fn health_check(&self) -> StorageResult<()>;

    async fn get_node(&self, workspace: &Workspace, name: &str)
        -> StorageResult<Option<NodeAttributes>>;

    async fn upsert_node(
        &self,
        workspace: &Workspace,
        name: &str,
        attrs: &NodeAttributes,
    ) -> StorageResult<()>;

    /// Look up the edge between `a` and `b` in either direction
    async fn get_edge(
        &self,
        workspace: &Workspace,
        a: &str,
        b: &str,
    ) -> StorageResult<Option<EdgeAttributes>>;

    /// Upsert the edge keyed by the normalized endpoint pair
    async fn upsert_edge(
        &self,
        workspace: &Workspace,
        a: &str,
        b: &str,
        attrs: &EdgeAttributes,
    ) -> StorageResult<()>;

    /// Nodes in a workspace, ordered by name
    async fn list_nodes(
        &self,
        workspace: &Workspace,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(String, NodeAttributes)>>;

    async fn node_count(&self, workspace: &Workspace) -> StorageResult<usize>;

    async fn edge_count(&self, workspace: &Workspace) -> StorageResult<usize>;
}

/// Vector storage backend
#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn health_check(&self) -> StorageResult<()>;

    async fn upsert_vector(
        &self,
        id: &str,
        workspace: &Workspace,
        embedding: &[f32],
        text: &str,
    ) -> StorageResult<()>;

    async fn get_vector(&self, id: &str, workspace: &Workspace)
        -> StorageResult<Option<VectorRecord>>;

    async fn count(&self, workspace: &Workspace) -> StorageResult<usize>;
}

/// Extension trait for opening file-backed stores
pub trait OpenStore: Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
