//! What a merge job reports back to its invoker

use crate::graph::Workspace;
use crate::lock::LockStats;
use crate::outcome::UnitFailure;
use crate::partition::PartitionStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Informational counters; never used for merge decisions
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub partition: PartitionStats,
    /// Placeholder entities created for unknown relationship endpoints
    pub stubs_created: usize,
    /// Components stopped by a lock timeout
    pub components_abandoned: usize,
    pub components_timed_out: usize,
    /// Lock manager counters when the job finished
    pub locks: LockStats,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub workspace: Workspace,
    /// Components whose merge ran to the end (unit failures allowed)
    pub components_processed: usize,
    /// Components abandoned, timed out, cancelled, or crashed
    pub components_failed: usize,
    pub entities_merged: usize,
    pub relationships_merged: usize,
    /// Every failed unit, by name
    pub errors: Vec<UnitFailure>,
    pub cancelled: bool,
    pub stats: JobStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobSummary {
    pub(crate) fn new(job_id: Uuid, workspace: Workspace, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            workspace,
            components_processed: 0,
            components_failed: 0,
            entities_merged: 0,
            relationships_merged: 0,
            errors: Vec::new(),
            cancelled: false,
            stats: JobStats::default(),
            started_at,
            finished_at: started_at,
        }
    }

    /// Failures a reconciliation pass may re-run
    pub fn retryable(&self) -> Vec<&UnitFailure> {
        self.errors.iter().filter(|e| e.retryable).collect()
    }

    /// No failures and not cancelled
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }
}
