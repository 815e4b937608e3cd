//! Per-component merge under workspace-scoped locks
//!
//! Each merge unit (one entity name, or one endpoint pair) runs as
//! acquire → read stored record → fold → summarize if long → write → release.
//! The lock set is held across the read-modify-write, so two jobs merging
//! into the same record serialize and neither loses the other's fragments.

use super::aggregate::{fold_entity, fold_relationship, stub_entity, validate_relationship};
use super::summarizer::Summarizer;
use crate::cancel::CancellationToken;
use crate::graph::{EdgeKey, MergedEntity, MergedRelationship, RawEntity, RawRelationship, Workspace};
use crate::lock::{AcquireOptions, LockError, LockGuard, LockManager, LockSet};
use crate::outcome::{FailureKind, UnitFailure, UnitId};
use crate::partition::ComponentBatch;
use crate::storage::{StorageError, StorageWriter};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Faults that end the whole job rather than one unit
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("lock manager fault: {0}")]
    Lock(#[from] LockError),
}

/// Tunables for the merge engine
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSettings {
    /// Joined descriptions longer than this many characters are summarized
    pub summarization_threshold: usize,
    /// Length requested from the summarizer
    pub summary_max_length: usize,
    /// Upper bound on one summarizer call
    pub summarizer_timeout: Duration,
    /// How long a unit waits for its lock set; `None` waits indefinitely
    pub lock_wait_timeout: Option<Duration>,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            summarization_threshold: 2000,
            summary_max_length: 800,
            summarizer_timeout: Duration::from_secs(60),
            lock_wait_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Outcome of merging one component
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeResult {
    pub component_index: usize,
    pub merged_entities: Vec<MergedEntity>,
    pub merged_relationships: Vec<MergedRelationship>,
    /// Placeholder entities created for unknown relationship endpoints
    pub stub_entities: Vec<MergedEntity>,
    pub errors: Vec<UnitFailure>,
    /// A lock timeout stopped the component early
    pub abandoned: bool,
    /// Cancellation stopped the component early
    pub cancelled: bool,
}

impl MergeResult {
    fn new(component_index: usize) -> Self {
        Self {
            component_index,
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Units a component has settled so far
///
/// Shared with the job so a component whose task is dropped (time budget
/// exceeded, or a panic) can still be accounted for unit by unit.
#[derive(Debug, Default)]
pub struct ComponentProgress {
    entities: BTreeSet<String>,
    relationships: BTreeSet<EdgeKey>,
    settled: Mutex<Settled>,
}

#[derive(Debug, Default)]
struct Settled {
    entities: BTreeSet<String>,
    relationships: BTreeSet<EdgeKey>,
    stubs: usize,
    failures: Vec<UnitFailure>,
}

impl ComponentProgress {
    pub fn for_batch(batch: &ComponentBatch) -> Self {
        Self {
            entities: batch.entities.iter().map(|r| r.key().to_string()).collect(),
            relationships: batch.relationships.iter().map(RawRelationship::key).collect(),
            settled: Mutex::default(),
        }
    }

    fn settled(&self) -> MutexGuard<'_, Settled> {
        self.settled.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entity_committed(&self, name: &str) {
        self.settled().entities.insert(name.to_string());
    }

    fn relationship_committed(&self, key: &EdgeKey, stubs: usize) {
        let mut settled = self.settled();
        settled.relationships.insert(key.clone());
        settled.stubs += stubs;
    }

    fn failed(&self, failure: &UnitFailure) {
        self.settled().failures.push(failure.clone());
    }

    pub fn committed_entities(&self) -> usize {
        self.settled().entities.len()
    }

    pub fn committed_relationships(&self) -> usize {
        self.settled().relationships.len()
    }

    pub fn stubs_created(&self) -> usize {
        self.settled().stubs
    }

    /// Failures for a component that stopped without a result: those
    /// already recorded, then one `kind` failure per unit never settled.
    pub fn interrupted(
        &self,
        index: usize,
        kind: FailureKind,
        reason: &str,
    ) -> Vec<UnitFailure> {
        let settled = self.settled();
        let mut failures = settled.failures.clone();
        let failed: HashSet<UnitId> = failures.iter().map(|f| f.unit.clone()).collect();

        let entities = self
            .entities
            .iter()
            .filter(|name| !settled.entities.contains(*name))
            .map(|name| UnitId::entity(name.as_str()));
        let relationships = self
            .relationships
            .iter()
            .filter(|key| !settled.relationships.contains(*key))
            .map(UnitId::relationship);
        for unit in entities.chain(relationships) {
            if !failed.contains(&unit) {
                failures.push(UnitFailure::new(unit, kind, reason).in_component(index));
            }
        }

        if failures.is_empty() {
            failures.push(UnitFailure::new(UnitId::component(index), kind, reason).in_component(index));
        }
        failures
    }
}

enum UnitError {
    /// The unit failed; the component continues
    Failed(UnitFailure),
    /// The unit's locks were not granted in time; the component stops
    LockTimeout(UnitFailure),
    /// The job was cancelled; the component stops
    Cancelled(UnitFailure),
    /// The lock table itself is broken; the job stops
    Fatal(LockError),
}

fn storage_failure(unit: &UnitId, context: &str, e: StorageError) -> UnitError {
    let kind = if e.is_transient() {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    };
    UnitError::Failed(UnitFailure::new(unit.clone(), kind, format!("{}: {}", context, e)))
}

/// Why the remaining units of a component are skipped
struct Stop {
    kind: FailureKind,
    reason: &'static str,
}

static ABANDONED: Stop = Stop {
    kind: FailureKind::LockTimeout,
    reason: "component abandoned after lock timeout",
};

static CANCELLED: Stop = Stop {
    kind: FailureKind::Cancelled,
    reason: "job cancelled before unit ran",
};

pub struct MergeEngine {
    locks: Arc<dyn LockManager>,
    writer: StorageWriter,
    summarizer: Arc<dyn Summarizer>,
    /// Semaphore to limit concurrent summarizer calls
    summarizer_permits: Option<Arc<Semaphore>>,
    settings: MergeSettings,
}

impl MergeEngine {
    pub fn new(
        locks: Arc<dyn LockManager>,
        writer: StorageWriter,
        summarizer: Arc<dyn Summarizer>,
        settings: MergeSettings,
    ) -> Self {
        Self {
            locks,
            writer,
            summarizer,
            summarizer_permits: None,
            settings,
        }
    }

    /// Bound the number of summarizer calls in flight across components
    pub fn with_summarizer_concurrency(mut self, limit: usize) -> Self {
        self.summarizer_permits = Some(Arc::new(Semaphore::new(limit.clamp(1, Semaphore::MAX_PERMITS))));
        self
    }

    pub fn settings(&self) -> &MergeSettings {
        &self.settings
    }

    pub fn writer(&self) -> &StorageWriter {
        &self.writer
    }

    /// Merge every entity group, then every relationship group, of one
    /// component. Unit failures land in `errors`; only a lock table fault is
    /// returned as `Err`.
    pub async fn merge_component(
        &self,
        batch: &ComponentBatch,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<MergeResult, MergeError> {
        let progress = ComponentProgress::for_batch(batch);
        self.merge_component_tracked(batch, workspace, cancel, &progress)
            .await
    }

    /// [`merge_component`](Self::merge_component), settling each unit into
    /// `progress` as it finishes.
    pub async fn merge_component_tracked(
        &self,
        batch: &ComponentBatch,
        workspace: &Workspace,
        cancel: &CancellationToken,
        progress: &ComponentProgress,
    ) -> Result<MergeResult, MergeError> {
        let index = batch.index();
        let mut result = MergeResult::new(index);
        let mut stop: Option<&'static Stop> = None;

        let mut entity_groups: BTreeMap<String, Vec<RawEntity>> = BTreeMap::new();
        for raw in &batch.entities {
            entity_groups
                .entry(raw.key().to_string())
                .or_default()
                .push(raw.clone());
        }
        let mut relationship_groups: BTreeMap<EdgeKey, Vec<RawRelationship>> = BTreeMap::new();
        for raw in &batch.relationships {
            relationship_groups.entry(raw.key()).or_default().push(raw.clone());
        }

        tracing::debug!(
            workspace = %workspace,
            component = index,
            entities = entity_groups.len(),
            relationships = relationship_groups.len(),
            "merging component"
        );

        for (name, raws) in &entity_groups {
            let unit = UnitId::entity(name.as_str());
            if stop.is_none() && cancel.is_cancelled() {
                stop = Some(&CANCELLED);
            }
            if let Some(s) = stop {
                let failure = UnitFailure::new(unit, s.kind, s.reason).in_component(index);
                progress.failed(&failure);
                result.errors.push(failure);
                continue;
            }

            match self.merge_entity(name, raws, workspace, cancel, &unit).await {
                Ok(entity) => {
                    progress.entity_committed(name);
                    result.merged_entities.push(entity);
                }
                Err(e) => stop = self.record(e, &mut result, progress)?.or(stop),
            }
        }

        for (key, raws) in &relationship_groups {
            let unit = UnitId::relationship(key);
            if stop.is_none() && cancel.is_cancelled() {
                stop = Some(&CANCELLED);
            }
            if let Some(s) = stop {
                let failure = UnitFailure::new(unit, s.kind, s.reason).in_component(index);
                progress.failed(&failure);
                result.errors.push(failure);
                continue;
            }

            match self
                .merge_relationship(key, raws, workspace, cancel, &unit)
                .await
            {
                Ok((rel, stubs)) => {
                    progress.relationship_committed(key, stubs.len());
                    result.merged_relationships.push(rel);
                    result.stub_entities.extend(stubs);
                }
                Err(e) => stop = self.record(e, &mut result, progress)?.or(stop),
            }
        }

        result.abandoned = matches!(stop, Some(s) if s.kind == FailureKind::LockTimeout);
        result.cancelled = matches!(stop, Some(s) if s.kind == FailureKind::Cancelled);
        if !result.errors.is_empty() {
            tracing::warn!(
                workspace = %workspace,
                component = index,
                failures = result.errors.len(),
                abandoned = result.abandoned,
                "component merged with failures"
            );
        }
        Ok(result)
    }

    /// File a unit error into the result; returns the stop it implies
    fn record(
        &self,
        error: UnitError,
        result: &mut MergeResult,
        progress: &ComponentProgress,
    ) -> Result<Option<&'static Stop>, MergeError> {
        let index = result.component_index;
        let (failure, stop) = match error {
            UnitError::Failed(f) => {
                tracing::warn!(component = index, unit = %f.unit, kind = %f.kind, reason = %f.reason, "merge unit failed");
                (f, None)
            }
            UnitError::LockTimeout(f) => {
                tracing::warn!(component = index, unit = %f.unit, reason = %f.reason, "lock timeout, abandoning component");
                (f, Some(&ABANDONED))
            }
            UnitError::Cancelled(f) => (f, Some(&CANCELLED)),
            UnitError::Fatal(e) => {
                tracing::error!(component = index, error = %e, "lock table fault");
                return Err(MergeError::Lock(e));
            }
        };
        let failure = failure.in_component(index);
        progress.failed(&failure);
        result.errors.push(failure);
        Ok(stop)
    }

    async fn acquire(
        &self,
        set: &LockSet,
        cancel: &CancellationToken,
        unit: &UnitId,
    ) -> Result<LockGuard, UnitError> {
        let options = AcquireOptions {
            timeout: self.settings.lock_wait_timeout,
            cancel: Some(cancel.clone()),
        };
        match self.locks.acquire(set, &options).await {
            Ok(guard) => Ok(guard),
            Err(LockError::Timeout { waited, .. }) => Err(UnitError::LockTimeout(UnitFailure::new(
                unit.clone(),
                FailureKind::LockTimeout,
                format!("lock set not granted within {:?}", waited),
            ))),
            Err(LockError::Cancelled) => Err(UnitError::Cancelled(UnitFailure::new(
                unit.clone(),
                FailureKind::Cancelled,
                "job cancelled while waiting for locks",
            ))),
            Err(e) if e.is_fatal() => Err(UnitError::Fatal(e)),
            Err(e) => Err(UnitError::Failed(UnitFailure::new(
                unit.clone(),
                FailureKind::Internal,
                e.to_string(),
            ))),
        }
    }

    async fn merge_entity(
        &self,
        name: &str,
        raws: &[RawEntity],
        workspace: &Workspace,
        cancel: &CancellationToken,
        unit: &UnitId,
    ) -> Result<MergedEntity, UnitError> {
        if name.is_empty() {
            return Err(UnitError::Failed(UnitFailure::new(
                unit.clone(),
                FailureKind::Validation,
                "entity name is empty",
            )));
        }

        let _guard = self
            .acquire(&LockSet::for_entity(workspace, name), cancel, unit)
            .await?;

        let existing = self
            .writer
            .read_entity(workspace, name)
            .await
            .map_err(|e| storage_failure(unit, "reading stored entity", e))?;

        let mut merged = fold_entity(name, workspace, raws, existing.as_ref(), Utc::now());
        merged.description = match &existing {
            // Nothing new to describe: keep the stored (possibly summarized) text.
            Some(stored) if stored.description_fragments == merged.description_fragments => {
                stored.description.clone()
            }
            _ => self.summarize_if_long(merged.description, unit).await,
        };

        self.writer
            .commit_entity(&merged, workspace)
            .await
            .map_err(UnitError::Failed)?;
        Ok(merged)
    }

    async fn merge_relationship(
        &self,
        key: &EdgeKey,
        raws: &[RawRelationship],
        workspace: &Workspace,
        cancel: &CancellationToken,
        unit: &UnitId,
    ) -> Result<(MergedRelationship, Vec<MergedEntity>), UnitError> {
        for raw in raws {
            validate_relationship(raw).map_err(|reason| {
                UnitError::Failed(UnitFailure::new(unit.clone(), FailureKind::Validation, reason))
            })?;
        }

        let _guard = self
            .acquire(&LockSet::for_relationship(workspace, &key.a, &key.b), cancel, unit)
            .await?;

        // Endpoints absent from storage get a stub so the edge never dangles.
        let mut stubs = Vec::new();
        for endpoint in [&key.a, &key.b] {
            let stored = self
                .writer
                .read_entity(workspace, endpoint)
                .await
                .map_err(|e| storage_failure(unit, "reading endpoint", e))?;
            if stored.is_none() {
                let stub = stub_entity(endpoint, workspace, raws, Utc::now());
                self.writer
                    .commit_entity(&stub, workspace)
                    .await
                    .map_err(|f| {
                        UnitError::Failed(UnitFailure::new(
                            unit.clone(),
                            f.kind,
                            format!("creating stub entity {}: {}", endpoint, f.reason),
                        ))
                    })?;
                tracing::debug!(workspace = %workspace, entity = %endpoint, "created stub entity");
                stubs.push(stub);
            }
        }

        let existing = self
            .writer
            .read_relationship(workspace, &key.a, &key.b)
            .await
            .map_err(|e| storage_failure(unit, "reading stored relationship", e))?;

        let Some(mut merged) = fold_relationship(workspace, raws, existing.as_ref(), Utc::now())
        else {
            return Err(UnitError::Failed(UnitFailure::new(
                unit.clone(),
                FailureKind::Internal,
                "relationship group is empty",
            )));
        };
        merged.description = match &existing {
            Some(stored) if stored.description_fragments == merged.description_fragments => {
                stored.description.clone()
            }
            _ => self.summarize_if_long(merged.description, unit).await,
        };

        self.writer
            .commit_relationship(&merged, workspace)
            .await
            .map_err(UnitError::Failed)?;
        Ok((merged, stubs))
    }

    /// Summarize a joined description over the threshold. Any summarizer
    /// failure keeps the full text.
    async fn summarize_if_long(&self, joined: String, unit: &UnitId) -> String {
        let length = joined.chars().count();
        if length <= self.settings.summarization_threshold {
            return joined;
        }

        let _permit = match &self.summarizer_permits {
            Some(permits) => permits.acquire().await.ok(),
            None => None,
        };
        let call = self
            .summarizer
            .summarize(&joined, self.settings.summary_max_length);
        match tokio::time::timeout(self.settings.summarizer_timeout, call).await {
            Ok(Ok(summary)) if !summary.trim().is_empty() => {
                tracing::debug!(unit = %unit, from = length, to = summary.chars().count(), "description summarized");
                summary
            }
            Ok(Ok(_)) => {
                tracing::warn!(unit = %unit, summarizer = self.summarizer.id(), "empty summary, keeping full description");
                joined
            }
            Ok(Err(e)) => {
                tracing::warn!(unit = %unit, summarizer = self.summarizer.id(), error = %e, "summarization failed, keeping full description");
                joined
            }
            Err(_) => {
                tracing::warn!(unit = %unit, summarizer = self.summarizer.id(), "summarizer timed out, keeping full description");
                joined
            }
        }
    }
}
