//! Storage Writer: per-record upserts to the graph and vector backends
//!
//! Every merged entity or relationship is written as its own upsert to each
//! backend. A failure is reported for that record and never rolls back
//! anything already committed. The two backends are written independently;
//! repeated upserts of the same record are idempotent, so a later
//! reconciliation pass can repair divergence by re-running the unit.

use super::embedding::{Embedder, EmbeddingError};
use super::retry::RetryPolicy;
use super::traits::{EdgeAttributes, GraphBackend, NodeAttributes, StorageError, StorageResult, VectorBackend};
use crate::graph::{EdgeKey, MergedEntity, MergedRelationship, Workspace};
use crate::outcome::{FailureKind, UnitFailure, UnitId};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Outcome of a batch commit
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitResult {
    pub entities_committed: usize,
    pub relationships_committed: usize,
    pub failures: Vec<UnitFailure>,
}

impl CommitResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Deterministic vector id for an entity
pub fn entity_vector_id(workspace: &Workspace, name: &str) -> String {
    let key = format!("{}/{}", workspace, name);
    format!("ent-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()))
}

/// Deterministic vector id for a relationship, independent of direction
pub fn relationship_vector_id(workspace: &Workspace, a: &str, b: &str) -> String {
    let edge = EdgeKey::new(a, b);
    let key = format!("{}/{}\u{1f}{}", workspace, edge.a, edge.b);
    format!("rel-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()))
}

impl From<&MergedEntity> for NodeAttributes {
    fn from(entity: &MergedEntity) -> Self {
        Self {
            entity_type: entity.entity_type.clone(),
            description: entity.description.clone(),
            description_fragments: entity.description_fragments.iter().cloned().collect(),
            source_ids: entity.source_ids.iter().cloned().collect(),
            file_paths: entity.file_paths.iter().cloned().collect(),
            updated_at: entity.updated_at,
        }
    }
}

impl From<&MergedRelationship> for EdgeAttributes {
    fn from(rel: &MergedRelationship) -> Self {
        Self {
            source_name: rel.source_name.clone(),
            target_name: rel.target_name.clone(),
            description: rel.description.clone(),
            description_fragments: rel.description_fragments.iter().cloned().collect(),
            keywords: rel.keywords.iter().cloned().collect(),
            weight: rel.weight,
            weight_contributions: rel.weight_contributions.clone(),
            source_ids: rel.source_ids.iter().cloned().collect(),
            file_paths: rel.file_paths.iter().cloned().collect(),
            updated_at: rel.updated_at,
        }
    }
}

/// Rebuild a merged entity from its stored node
pub fn entity_from_node(workspace: &Workspace, name: &str, attrs: NodeAttributes) -> MergedEntity {
    MergedEntity {
        name: name.to_string(),
        entity_type: attrs.entity_type,
        description: attrs.description,
        description_fragments: attrs.description_fragments.into_iter().collect(),
        source_ids: attrs.source_ids.into_iter().collect(),
        file_paths: attrs.file_paths.into_iter().collect(),
        workspace: workspace.clone(),
        updated_at: attrs.updated_at,
    }
}

/// Rebuild a merged relationship from its stored edge
pub fn relationship_from_edge(workspace: &Workspace, attrs: EdgeAttributes) -> MergedRelationship {
    MergedRelationship {
        source_name: attrs.source_name,
        target_name: attrs.target_name,
        description: attrs.description,
        description_fragments: attrs.description_fragments.into_iter().collect(),
        keywords: attrs.keywords.into_iter().collect(),
        weight: attrs.weight,
        weight_contributions: attrs.weight_contributions,
        source_ids: attrs.source_ids.into_iter().collect(),
        file_paths: attrs.file_paths.into_iter().collect(),
        workspace: workspace.clone(),
        updated_at: attrs.updated_at,
    }
}

/// A failed write to one backend
struct BackendFailure {
    backend: String,
    permanent: bool,
    message: String,
}

impl BackendFailure {
    fn storage(backend: &str, e: StorageError) -> Self {
        Self {
            backend: backend.to_string(),
            permanent: !e.is_transient(),
            message: e.to_string(),
        }
    }

    fn embedding(backend: &str, e: EmbeddingError) -> Self {
        Self {
            backend: backend.to_string(),
            permanent: !e.is_transient(),
            message: e.to_string(),
        }
    }
}

fn into_unit_failure(unit: UnitId, failures: Vec<BackendFailure>) -> UnitFailure {
    let kind = if failures.iter().any(|f| f.permanent) {
        FailureKind::Permanent
    } else {
        FailureKind::Transient
    };
    let reason = failures
        .iter()
        .map(|f| format!("{} backend: {}", f.backend, f.message))
        .collect::<Vec<_>>()
        .join("; ");
    UnitFailure::new(unit, kind, reason)
}

/// Writes merged records to both backends with bounded retry
#[derive(Clone)]
pub struct StorageWriter {
    graph: Arc<dyn GraphBackend>,
    vector: Arc<dyn VectorBackend>,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
    permits: Option<Arc<Semaphore>>,
}

impl StorageWriter {
    pub fn new(
        graph: Arc<dyn GraphBackend>,
        vector: Arc<dyn VectorBackend>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            graph,
            vector,
            embedder,
            retry: RetryPolicy::default(),
            permits: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound the number of records being written at once
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.permits = Some(Arc::new(Semaphore::new(limit.clamp(1, Semaphore::MAX_PERMITS))));
        self
    }

    pub fn graph(&self) -> &Arc<dyn GraphBackend> {
        &self.graph
    }

    pub fn vector(&self) -> &Arc<dyn VectorBackend> {
        &self.vector
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Check both backends, retrying transient errors
    pub async fn health_check(&self) -> StorageResult<()> {
        self.retry
            .run("graph health check", || self.graph.health_check())
            .await?;
        self.retry
            .run("vector health check", || self.vector.health_check())
            .await
    }

    /// Read a stored node, retrying transient errors
    pub async fn read_entity(
        &self,
        workspace: &Workspace,
        name: &str,
    ) -> StorageResult<Option<MergedEntity>> {
        let node = self
            .retry
            .run("get_node", || self.graph.get_node(workspace, name))
            .await?;
        Ok(node.map(|attrs| entity_from_node(workspace, name, attrs)))
    }

    /// Read a stored edge in either direction, retrying transient errors
    pub async fn read_relationship(
        &self,
        workspace: &Workspace,
        a: &str,
        b: &str,
    ) -> StorageResult<Option<MergedRelationship>> {
        let edge = self
            .retry
            .run("get_edge", || self.graph.get_edge(workspace, a, b))
            .await?;
        Ok(edge.map(|attrs| relationship_from_edge(workspace, attrs)))
    }

    async fn write_vector(
        &self,
        id: &str,
        workspace: &Workspace,
        text: &str,
    ) -> Result<(), BackendFailure> {
        let embedder_name = format!("embedder {}", self.embedder.name());
        let embedding = self
            .retry
            .run("embed", || async { self.embedder.embed_batch(&[text]) })
            .await
            .map_err(|e| BackendFailure::embedding(&embedder_name, e))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                BackendFailure::embedding(&embedder_name, EmbeddingError::EmptyResult)
            })?;

        self.retry
            .run("upsert_vector", || {
                self.vector.upsert_vector(id, workspace, &embedding, text)
            })
            .await
            .map_err(|e| BackendFailure::storage(&format!("vector {}", self.vector.name()), e))
    }

    /// Upsert one entity to both backends
    pub async fn commit_entity(
        &self,
        entity: &MergedEntity,
        workspace: &Workspace,
    ) -> Result<(), UnitFailure> {
        let unit = UnitId::entity(entity.name.as_str());
        if entity.workspace != *workspace {
            return Err(UnitFailure::new(
                unit,
                FailureKind::Validation,
                format!(
                    "record belongs to workspace {}, job is bound to {}",
                    entity.workspace, workspace
                ),
            ));
        }
        let _permit = self.permit(&unit).await?;

        let mut failures = Vec::new();
        let attrs = NodeAttributes::from(entity);
        if let Err(e) = self
            .retry
            .run("upsert_node", || {
                self.graph.upsert_node(workspace, &entity.name, &attrs)
            })
            .await
        {
            failures.push(BackendFailure::storage(
                &format!("graph {}", self.graph.name()),
                e,
            ));
        }

        let id = entity_vector_id(workspace, &entity.name);
        let text = format!("{}\n{}", entity.name, entity.description);
        if let Err(f) = self.write_vector(&id, workspace, &text).await {
            failures.push(f);
        }

        if failures.is_empty() {
            tracing::debug!(workspace = %workspace, entity = %entity.name, "entity committed");
            Ok(())
        } else {
            Err(into_unit_failure(unit, failures))
        }
    }

    /// Upsert one relationship to both backends
    pub async fn commit_relationship(
        &self,
        rel: &MergedRelationship,
        workspace: &Workspace,
    ) -> Result<(), UnitFailure> {
        let unit = UnitId::relationship(&rel.key());
        if rel.workspace != *workspace {
            return Err(UnitFailure::new(
                unit,
                FailureKind::Validation,
                format!(
                    "record belongs to workspace {}, job is bound to {}",
                    rel.workspace, workspace
                ),
            ));
        }
        let _permit = self.permit(&unit).await?;

        let mut failures = Vec::new();
        let attrs = EdgeAttributes::from(rel);
        if let Err(e) = self
            .retry
            .run("upsert_edge", || {
                self.graph
                    .upsert_edge(workspace, &rel.source_name, &rel.target_name, &attrs)
            })
            .await
        {
            failures.push(BackendFailure::storage(
                &format!("graph {}", self.graph.name()),
                e,
            ));
        }

        let id = relationship_vector_id(workspace, &rel.source_name, &rel.target_name);
        let text = format!(
            "{}\t{}\n{}\n{}",
            rel.keywords_joined(),
            rel.source_name,
            rel.target_name,
            rel.description
        );
        if let Err(f) = self.write_vector(&id, workspace, &text).await {
            failures.push(f);
        }

        if failures.is_empty() {
            tracing::debug!(
                workspace = %workspace,
                source = %rel.source_name,
                target = %rel.target_name,
                weight = rel.weight,
                "relationship committed"
            );
            Ok(())
        } else {
            Err(into_unit_failure(unit, failures))
        }
    }

    /// Upsert a batch of records, one independent write per record
    pub async fn commit(
        &self,
        entities: &[MergedEntity],
        relationships: &[MergedRelationship],
        workspace: &Workspace,
    ) -> CommitResult {
        let mut result = CommitResult::default();
        for entity in entities {
            match self.commit_entity(entity, workspace).await {
                Ok(()) => result.entities_committed += 1,
                Err(failure) => result.failures.push(failure),
            }
        }
        for rel in relationships {
            match self.commit_relationship(rel, workspace).await {
                Ok(()) => result.relationships_committed += 1,
                Err(failure) => result.failures.push(failure),
            }
        }
        result
    }

    async fn permit(
        &self,
        unit: &UnitId,
    ) -> Result<Option<tokio::sync::SemaphorePermit<'_>>, UnitFailure> {
        match &self.permits {
            Some(permits) => permits.acquire().await.map(Some).map_err(|_| {
                UnitFailure::new(unit.clone(), FailureKind::Internal, "write permits closed")
            }),
            None => Ok(None),
        }
    }
}
