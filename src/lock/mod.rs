//! Workspace-scoped lock manager
//!
//! A merge unit names every key it needs up front as a [`LockSet`]. The set
//! is granted whole or not at all, in the byte order of the serialized keys,
//! so two operations with overlapping sets always contend on the same first
//! key and no cycle of waiters can form. Holds are released when the
//! [`LockGuard`] drops, on every exit path.
//!
//! Two interchangeable implementations sit behind [`LockManager`]:
//! - [`InMemoryLockManager`]: one process, mutex-protected table
//! - [`SqliteLockManager`]: a lease table in a SQLite file shared by processes

mod key;
mod memory;
mod sqlite;

pub use key::{LockKey, LockSet};
pub use memory::InMemoryLockManager;
pub use sqlite::SqliteLockManager;

use crate::cancel::CancellationToken;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from lock acquisition
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for {keys:?}")]
    Timeout { keys: Vec<String>, waited: Duration },

    #[error("lock acquisition cancelled")]
    Cancelled,

    #[error("lock set is empty")]
    EmptySet,

    #[error("lock set spans workspaces {first} and {second}")]
    MixedWorkspaces { first: String, second: String },

    #[error("lock table poisoned by a panicking holder")]
    Poisoned,

    #[error("lock table backend error: {0}")]
    Backend(String),

    #[error("lock lease must be positive")]
    ZeroLease,
}

impl LockError {
    /// Faults in the lock table itself. These end the whole job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Poisoned | Self::Backend(_))
    }
}

impl From<rusqlite::Error> for LockError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Per-acquisition options
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Give up after this long; `None` waits indefinitely
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Counters reported by a lock manager (informational)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LockStats {
    pub acquisitions: u64,
    /// Acquisitions that had to wait at least once
    pub contended: u64,
    pub timeouts: u64,
    pub cancellations: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LockCounters {
    acquisitions: AtomicU64,
    contended: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
}

impl LockCounters {
    pub(crate) fn granted(&self, waited: bool) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        if waited {
            self.contended.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cancelled(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LockStats {
        LockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }
}

/// Releases a holder's keys. Called from `Drop`, so it cannot fail loudly.
pub(crate) trait LockRelease: Send + Sync {
    fn release(&self, holder: &str, keys: &[String]);
}

/// A granted lock set. Dropping it releases every key.
#[must_use = "dropping the guard releases the locks immediately"]
pub struct LockGuard {
    holder: String,
    keys: Vec<String>,
    releaser: Option<Arc<dyn LockRelease>>,
}

impl LockGuard {
    pub(crate) fn new(holder: String, keys: Vec<String>, releaser: Arc<dyn LockRelease>) -> Self {
        Self {
            holder,
            keys,
            releaser: Some(releaser),
        }
    }

    /// Serialized keys held, in acquisition order
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release explicitly (same as dropping)
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(releaser) = self.releaser.take() {
            releaser.release(&self.holder, &self.keys);
            tracing::trace!(holder = %self.holder, keys = ?self.keys, "lock set released");
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("holder", &self.holder)
            .field("keys", &self.keys)
            .finish()
    }
}

/// Grants exclusive holds on workspace-scoped key sets
///
/// Implementations must be safe to share across tasks and jobs.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Short name for logs ("memory", "sqlite")
    fn name(&self) -> &str;

    /// Acquire every key in `set`, suspending until all are free.
    ///
    /// Never returns with a partial hold: on timeout or cancellation nothing
    /// is held.
    async fn acquire(&self, set: &LockSet, options: &AcquireOptions)
        -> Result<LockGuard, LockError>;

    fn stats(&self) -> LockStats;

    /// How long a grant lasts without release. `None` holds until released.
    fn lease(&self) -> Option<Duration> {
        None
    }
}

/// Sleep until `deadline`, or forever without one
pub(crate) async fn deadline_or_pending(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
