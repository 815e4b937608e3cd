//! Instance/Workspace Manager: one merge job over one batch
//!
//! A job is bound to a single workspace and builds everything it mutates
//! (merge engine, writer, semaphore, result buffers) fresh per run. The only
//! state shared with other jobs is the injected lock manager and the
//! backends' own connections.
//!
//! Pipeline: health check → partition → bounded fan-out of component merges
//! (each under an optional time budget) → aggregate into a [`JobSummary`].

mod backends;
mod summary;

pub use backends::Backends;
pub use summary::{JobStats, JobSummary};

use crate::cancel::CancellationToken;
use crate::config::{ConfigError, MergeConfig};
use crate::graph::{RawBatch, RawEntity, RawRelationship, Workspace};
use crate::lock::LockError;
use crate::merge::{ComponentProgress, MergeEngine, MergeError, MergeResult};
use crate::outcome::FailureKind;
use crate::partition::{partition_batch, ComponentBatch, ConnectedComponent, PartitionStats};
use crate::storage::StorageWriter;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Faults that end a job. Everything else is reported in the summary.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("lock table fault: {0}")]
    LockTable(#[from] LockError),
}

impl From<MergeError> for JobError {
    fn from(e: MergeError) -> Self {
        match e {
            MergeError::Lock(e) => Self::LockTable(e),
        }
    }
}

/// How one component task ended
enum ComponentOutcome {
    Merged(MergeResult),
    TimedOut(Duration),
    Fatal(MergeError),
}

/// A merge job bound to one workspace
pub struct MergeJob {
    job_id: Uuid,
    workspace: Workspace,
    config: MergeConfig,
    backends: Backends,
    cancel: CancellationToken,
}

impl MergeJob {
    pub fn new(
        workspace: Workspace,
        config: MergeConfig,
        backends: Backends,
    ) -> Result<Self, JobError> {
        config.validate()?;
        if let Some(lease) = backends.locks.lease() {
            config.check_lease(lease)?;
        }
        Ok(Self {
            job_id: Uuid::new_v4(),
            workspace,
            config,
            backends,
            cancel: CancellationToken::new(),
        })
    }

    /// Use an invoker-supplied token instead of a fresh one. Each run
    /// works on a child of it.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// A handle the invoker can cancel the job with
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    fn build_engine(&self) -> MergeEngine {
        let mut writer = StorageWriter::new(
            self.backends.graph.clone(),
            self.backends.vector.clone(),
            self.backends.embedder.clone(),
        )
        .with_retry(self.config.retry_policy());
        if let Some(limit) = self.config.storage_concurrency {
            writer = writer.with_concurrency_limit(limit);
        }

        let mut engine = MergeEngine::new(
            self.backends.locks.clone(),
            writer,
            self.backends.summarizer.clone(),
            self.config.merge_settings(),
        );
        if let Some(limit) = self.config.summarizer_concurrency {
            engine = engine.with_summarizer_concurrency(limit);
        }
        engine
    }

    /// Run the job over one batch of raw records
    pub async fn run(
        &self,
        raw_entities: Vec<RawEntity>,
        raw_relationships: Vec<RawRelationship>,
    ) -> Result<JobSummary, JobError> {
        let span = tracing::info_span!(
            "merge_job",
            job_id = %self.job_id,
            workspace = %self.workspace
        );
        self.run_inner(RawBatch::new(raw_entities, raw_relationships))
            .instrument(span)
            .await
    }

    async fn run_inner(&self, batch: RawBatch) -> Result<JobSummary, JobError> {
        let started = Instant::now();
        let mut summary = JobSummary::new(self.job_id, self.workspace.clone(), Utc::now());

        let engine = Arc::new(self.build_engine());
        engine
            .writer()
            .health_check()
            .await
            .map_err(|e| JobError::BackendUnavailable(e.to_string()))?;

        let components = partition_batch(&batch);
        let shapes: Vec<ConnectedComponent> =
            components.iter().map(|c| c.component.clone()).collect();
        summary.stats.partition = PartitionStats::from_components(&shapes);
        tracing::info!(
            entities = batch.entities.len(),
            relationships = batch.relationships.len(),
            components = components.len(),
            largest = summary.stats.partition.largest,
            "batch partitioned"
        );

        // Every run gets its own token: a fatal stop ends this run only.
        let run_token = self.cancel.child_token();
        let tracked: Vec<(ComponentBatch, Arc<ComponentProgress>)> = components
            .into_iter()
            .map(|c| {
                let progress = Arc::new(ComponentProgress::for_batch(&c));
                (c, progress)
            })
            .collect();
        let mut pending: BTreeMap<usize, Arc<ComponentProgress>> = tracked
            .iter()
            .map(|(c, progress)| (c.index(), progress.clone()))
            .collect();
        let mut tasks = self.spawn_components(engine, tracked, &run_token);

        let mut fatal: Option<MergeError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // Attributed below: the index stays in `pending`.
                    tracing::error!(error = %e, "component task failed");
                    continue;
                }
            };
            let Some(progress) = pending.remove(&index) else {
                continue;
            };

            match outcome {
                ComponentOutcome::Merged(result) => self.absorb(&mut summary, result),
                ComponentOutcome::TimedOut(budget) => {
                    tracing::warn!(
                        component = index,
                        budget_ms = budget.as_millis() as u64,
                        settled_entities = progress.committed_entities(),
                        "component timed out"
                    );
                    summary.stats.components_timed_out += 1;
                    self.absorb_interrupted(
                        &mut summary,
                        index,
                        &progress,
                        FailureKind::ComponentTimeout,
                        &format!("component exceeded its {:?} budget", budget),
                    );
                }
                ComponentOutcome::Fatal(e) => {
                    if fatal.is_none() {
                        // Stop the remaining components before they take more locks.
                        run_token.cancel();
                        fatal = Some(e);
                    }
                }
            }
        }

        if let Some(e) = fatal {
            tracing::error!(error = %e, "merge job aborted");
            return Err(e.into());
        }

        for (index, progress) in pending {
            self.absorb_interrupted(
                &mut summary,
                index,
                &progress,
                FailureKind::Internal,
                "component task panicked",
            );
        }

        summary.stats.locks = self.backends.locks.stats();
        summary.stats.duration_ms = started.elapsed().as_millis() as u64;
        summary.finished_at = Utc::now();
        summary.errors.sort_by_key(|e| e.component);

        tracing::info!(
            components_processed = summary.components_processed,
            components_failed = summary.components_failed,
            entities_merged = summary.entities_merged,
            relationships_merged = summary.relationships_merged,
            failures = summary.errors.len(),
            cancelled = summary.cancelled,
            duration_ms = summary.stats.duration_ms,
            "merge job finished"
        );
        Ok(summary)
    }

    fn spawn_components(
        &self,
        engine: Arc<MergeEngine>,
        components: Vec<(ComponentBatch, Arc<ComponentProgress>)>,
        run_token: &CancellationToken,
    ) -> JoinSet<(usize, ComponentOutcome)> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_components));
        let budget = self.config.component_timeout();
        let mut tasks = JoinSet::new();

        for (component, progress) in components {
            let engine = engine.clone();
            let semaphore = semaphore.clone();
            let workspace = self.workspace.clone();
            let cancel = run_token.clone();
            let span = tracing::debug_span!("component", index = component.index());

            tasks.spawn(
                async move {
                    let index = component.index();
                    // Waiting for a permit, not failing, is the backpressure.
                    let _permit = semaphore.acquire_owned().await;
                    let merge =
                        engine.merge_component_tracked(&component, &workspace, &cancel, &progress);
                    let outcome = match budget {
                        Some(budget) => match tokio::time::timeout(budget, merge).await {
                            Ok(result) => result,
                            Err(_) => return (index, ComponentOutcome::TimedOut(budget)),
                        },
                        None => merge.await,
                    };
                    match outcome {
                        Ok(result) => (index, ComponentOutcome::Merged(result)),
                        Err(e) => (index, ComponentOutcome::Fatal(e)),
                    }
                }
                .instrument(span),
            );
        }
        tasks
    }

    fn absorb(&self, summary: &mut JobSummary, result: MergeResult) {
        if result.abandoned || result.cancelled {
            summary.components_failed += 1;
        } else {
            summary.components_processed += 1;
        }
        if result.abandoned {
            summary.stats.components_abandoned += 1;
        }
        // Only a component that actually skipped work marks the job cancelled.
        summary.cancelled |= result.cancelled;
        summary.entities_merged += result.merged_entities.len();
        summary.relationships_merged += result.merged_relationships.len();
        summary.stats.stubs_created += result.stub_entities.len();
        summary.errors.extend(result.errors);
    }

    /// Account for a component that ended without a result: what it
    /// committed counts, every unit it did not finish fails as `kind`.
    fn absorb_interrupted(
        &self,
        summary: &mut JobSummary,
        index: usize,
        progress: &ComponentProgress,
        kind: FailureKind,
        reason: &str,
    ) {
        summary.components_failed += 1;
        summary.entities_merged += progress.committed_entities();
        summary.relationships_merged += progress.committed_relationships();
        summary.stats.stubs_created += progress.stubs_created();
        summary.errors.extend(progress.interrupted(index, kind, reason));
    }
}

/// Run one merge job: the library entry point for a job invoker
pub async fn run_merge_job(
    workspace: &Workspace,
    raw_entities: Vec<RawEntity>,
    raw_relationships: Vec<RawRelationship>,
    config: &MergeConfig,
    backends: &Backends,
) -> Result<JobSummary, JobError> {
    MergeJob::new(workspace.clone(), config.clone(), backends.clone())?
        .run(raw_entities, raw_relationships)
        .await
}
