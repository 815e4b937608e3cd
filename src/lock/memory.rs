//! In-process lock table

use super::{
    deadline_or_pending, AcquireOptions, LockCounters, LockError, LockGuard, LockManager,
    LockRelease, LockSet, LockStats,
};
use crate::cancel::cancelled_or_pending;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Table {
    /// serialized key -> holder
    held: Mutex<HashMap<String, String>>,
    /// Woken whenever any key is released
    released: Notify,
    next_holder: AtomicU64,
    counters: LockCounters,
}

impl Table {
    /// Take every key or none, in a single critical section.
    fn try_take(&self, holder: &str, keys: &[String]) -> Result<bool, LockError> {
        let mut held = self.held.lock().map_err(|_| LockError::Poisoned)?;
        if keys.iter().any(|k| held.contains_key(k)) {
            return Ok(false);
        }
        for key in keys {
            held.insert(key.clone(), holder.to_string());
        }
        Ok(true)
    }
}

impl LockRelease for Table {
    fn release(&self, holder: &str, keys: &[String]) {
        {
            // Releasing must still work after a panic elsewhere poisoned the
            // mutex, or waiters would hang forever.
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            for key in keys {
                if held.get(key).map(String::as_str) == Some(holder) {
                    held.remove(key);
                }
            }
        }
        self.released.notify_waiters();
    }
}

/// Lock manager for jobs sharing one process
///
/// Cheap to clone; clones share the table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockManager {
    table: Arc<Table>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held (diagnostics and tests)
    pub fn held_count(&self) -> usize {
        self.table
            .held
            .lock()
            .map(|held| held.len())
            .unwrap_or_default()
    }

    /// Whether a serialized key is held
    pub fn is_held(&self, serialized_key: &str) -> bool {
        self.table
            .held
            .lock()
            .map(|held| held.contains_key(serialized_key))
            .unwrap_or_default()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    fn name(&self) -> &str {
        "memory"
    }

    async fn acquire(
        &self,
        set: &LockSet,
        options: &AcquireOptions,
    ) -> Result<LockGuard, LockError> {
        set.validate()?;
        let keys: Vec<String> = set.ordered_keys().map(str::to_owned).collect();
        let holder = format!(
            "mem-{}",
            self.table.next_holder.fetch_add(1, Ordering::Relaxed)
        );
        let started = Instant::now();
        let deadline = options.timeout.map(|t| started + t);
        let mut waited = false;

        loop {
            if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                self.table.counters.cancelled();
                return Err(LockError::Cancelled);
            }

            // Register for the release notification before checking the
            // table, so a release between the check and the wait is not lost.
            let released = self.table.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.table.try_take(&holder, &keys)? {
                self.table.counters.granted(waited);
                let releaser: Arc<dyn LockRelease> = self.table.clone();
                return Ok(LockGuard::new(holder, keys, releaser));
            }
            waited = true;

            tokio::select! {
                _ = &mut released => {}
                _ = cancelled_or_pending(options.cancel.as_ref()) => {
                    self.table.counters.cancelled();
                    return Err(LockError::Cancelled);
                }
                _ = deadline_or_pending(deadline) => {
                    self.table.counters.timed_out();
                    return Err(LockError::Timeout {
                        keys,
                        waited: started.elapsed(),
                    });
                }
            }
        }
    }

    fn stats(&self) -> LockStats {
        self.table.counters.snapshot()
    }
}
