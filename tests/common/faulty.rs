//! Graph stores that fail on demand

use async_trait::async_trait;
use graphweave::storage::{EdgeAttributes, InMemoryGraphStore, NodeAttributes};
use graphweave::{GraphBackend, StorageError, StorageResult, Workspace};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Rejects writes of the named entities with a permanent error
pub struct FailingGraphStore {
    inner: InMemoryGraphStore,
    poisoned: HashSet<String>,
}

impl FailingGraphStore {
    pub fn new(poisoned: &[&str]) -> Self {
        Self {
            inner: InMemoryGraphStore::new(),
            poisoned: poisoned.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl GraphBackend for FailingGraphStore {
    fn name(&self) -> &str {
        "failing"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await
    }

    async fn get_node(&self, workspace: &Workspace, name: &str) -> StorageResult<Option<NodeAttributes>> {
        self.inner.get_node(workspace, name).await
    }

    async fn upsert_node(&self, workspace: &Workspace, name: &str, attrs: &NodeAttributes) -> StorageResult<()> {
        if self.poisoned.contains(name) {
            return Err(StorageError::Validation(format!("rejected node {}", name)));
        }
        self.inner.upsert_node(workspace, name, attrs).await
    }

    async fn get_edge(&self, workspace: &Workspace, a: &str, b: &str) -> StorageResult<Option<EdgeAttributes>> {
        self.inner.get_edge(workspace, a, b).await
    }

    async fn upsert_edge(
        &self,
        workspace: &Workspace,
        a: &str,
        b: &str,
        attrs: &EdgeAttributes,
    ) -> StorageResult<()> {
        self.inner.upsert_edge(workspace, a, b, attrs).await
    }

    async fn list_nodes(
        &self,
        workspace: &Workspace,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(String, NodeAttributes)>> {
        self.inner.list_nodes(workspace, limit).await
    }

    async fn node_count(&self, workspace: &Workspace) -> StorageResult<usize> {
        self.inner.node_count(workspace).await
    }

    async fn edge_count(&self, workspace: &Workspace) -> StorageResult<usize> {
        self.inner.edge_count(workspace).await
    }
}

/// Fails the first `failures` node writes with a transient error
pub struct FlakyGraphStore {
    inner: InMemoryGraphStore,
    remaining: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyGraphStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryGraphStore::new(),
            remaining: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Node writes attempted, including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphBackend for FlakyGraphStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await
    }

    async fn get_node(&self, workspace: &Workspace, name: &str) -> StorageResult<Option<NodeAttributes>> {
        self.inner.get_node(workspace, name).await
    }

    async fn upsert_node(&self, workspace: &Workspace, name: &str, attrs: &NodeAttributes) -> StorageResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::ConnectionReset("peer went away".to_string()));
        }
        self.inner.upsert_node(workspace, name, attrs).await
    }

    async fn get_edge(&self, workspace: &Workspace, a: &str, b: &str) -> StorageResult<Option<EdgeAttributes>> {
        self.inner.get_edge(workspace, a, b).await
    }

    async fn upsert_edge(
        &self,
        workspace: &Workspace,
        a: &str,
        b: &str,
        attrs: &EdgeAttributes,
    ) -> StorageResult<()> {
        self.inner.upsert_edge(workspace, a, b, attrs).await
    }

    async fn list_nodes(
        &self,
        workspace: &Workspace,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(String, NodeAttributes)>> {
        self.inner.list_nodes(workspace, limit).await
    }

    async fn node_count(&self, workspace: &Workspace) -> StorageResult<usize> {
        self.inner.node_count(workspace).await
    }

    async fn edge_count(&self, workspace: &Workspace) -> StorageResult<usize> {
        self.inner.edge_count(workspace).await
    }
}
