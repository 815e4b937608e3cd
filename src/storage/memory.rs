//! In-memory backends (tests, single-process use without persistence)

use super::traits::{
    validate_key, EdgeAttributes, GraphBackend, NodeAttributes, StorageResult, VectorBackend,
    VectorRecord,
};
use crate::graph::{EdgeKey, Workspace};
use async_trait::async_trait;
use dashmap::DashMap;

/// Graph store backed by concurrent maps
///
/// Keyed by `(workspace, name)` and `(workspace, normalized pair)`, so data
/// from different workspaces never mixes.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    nodes: DashMap<(String, String), NodeAttributes>,
    edges: DashMap<(String, EdgeKey), EdgeAttributes>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphBackend for InMemoryGraphStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn get_node(
        &self,
        workspace: &Workspace,
        name: &str,
    ) -> StorageResult<Option<NodeAttributes>> {
        Ok(self
            .nodes
            .get(&(workspace.to_string(), name.to_string()))
            .map(|r| r.clone()))
    }

    async fn upsert_node(
        &self,
        workspace: &Workspace,
        name: &str,
        attrs: &NodeAttributes,
    ) -> StorageResult<()> {
        validate_key(workspace, &[name])?;
        self.nodes
            .insert((workspace.to_string(), name.to_string()), attrs.clone());
        Ok(())
    }

    async fn get_edge(
        &self,
        workspace: &Workspace,
        a: &str,
        b: &str,
    ) -> StorageResult<Option<EdgeAttributes>> {
        Ok(self
            .edges
            .get(&(workspace.to_string(), EdgeKey::new(a, b)))
            .map(|r| r.clone()))
    }

    async fn upsert_edge(
        &self,
        workspace: &Workspace,
        a: &str,
        b: &str,
        attrs: &EdgeAttributes,
    ) -> StorageResult<()> {
        validate_key(workspace, &[a, b])?;
        self.edges
            .insert((workspace.to_string(), EdgeKey::new(a, b)), attrs.clone());
        Ok(())
    }

    async fn list_nodes(
        &self,
        workspace: &Workspace,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(String, NodeAttributes)>> {
        let mut nodes: Vec<(String, NodeAttributes)> = self
            .nodes
            .iter()
            .filter(|r| r.key().0 == workspace.as_str())
            .map(|r| (r.key().1.clone(), r.value().clone()))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(limit) = limit {
            nodes.truncate(limit);
        }
        Ok(nodes)
    }

    async fn node_count(&self, workspace: &Workspace) -> StorageResult<usize> {
        Ok(self
            .nodes
            .iter()
            .filter(|r| r.key().0 == workspace.as_str())
            .count())
    }

    async fn edge_count(&self, workspace: &Workspace) -> StorageResult<usize> {
        Ok(self
            .edges
            .iter()
            .filter(|r| r.key().0 == workspace.as_str())
            .count())
    }
}

/// Vector store backed by a concurrent map, scoped by workspace
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    vectors: DashMap<(String, String), VectorRecord>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorBackend for InMemoryVectorStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn upsert_vector(
        &self,
        id: &str,
        workspace: &Workspace,
        embedding: &[f32],
        text: &str,
    ) -> StorageResult<()> {
        validate_key(workspace, &[id])?;
        self.vectors.insert(
            (workspace.to_string(), id.to_string()),
            VectorRecord {
                id: id.to_string(),
                workspace: workspace.clone(),
                embedding: embedding.to_vec(),
                text: text.to_string(),
            },
        );
        Ok(())
    }

    async fn get_vector(
        &self,
        id: &str,
        workspace: &Workspace,
    ) -> StorageResult<Option<VectorRecord>> {
        Ok(self
            .vectors
            .get(&(workspace.to_string(), id.to_string()))
            .map(|r| r.clone()))
    }

    async fn count(&self, workspace: &Workspace) -> StorageResult<usize> {
        Ok(self
            .vectors
            .iter()
            .filter(|r| r.key().0 == workspace.as_str())
            .count())
    }
}
