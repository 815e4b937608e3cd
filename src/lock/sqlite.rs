//! Lock table in a SQLite file, shared by every process that opens it
//!
//! Each held key is a row with its holder and a lease expiry. A set is taken
//! in one IMMEDIATE transaction: expired leases are purged, then every key is
//! inserted in order, or the transaction rolls back if any key is present.
//! Waiters cannot be notified across processes, so they poll with capped
//! exponential backoff. A crashed holder's rows expire with their lease.

use super::{
    deadline_or_pending, AcquireOptions, LockCounters, LockError, LockGuard, LockManager,
    LockRelease, LockSet, LockStats,
};
use crate::cancel::cancelled_or_pending;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const INITIAL_POLL: Duration = Duration::from_millis(5);
const MAX_POLL: Duration = Duration::from_millis(250);

struct Table {
    conn: Mutex<Connection>,
    lease: Duration,
    counters: LockCounters,
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

impl Table {
    fn init_schema(conn: &Connection) -> Result<(), LockError> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS lock_table (
                lock_key TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_lock_table_expiry
                ON lock_table(expires_at);
            "#,
        )?;
        Ok(())
    }

    fn try_take(&self, holder: &str, keys: &[String]) -> Result<bool, LockError> {
        let mut conn = self.conn.lock().map_err(|_| LockError::Poisoned)?;
        let now = Utc::now().timestamp_millis();
        let expires_at = now + self.lease.as_millis() as i64;

        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(e) if is_busy(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        tx.execute("DELETE FROM lock_table WHERE expires_at <= ?1", params![now])?;

        for key in keys {
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM lock_table WHERE lock_key = ?1)",
                params![key],
                |row| row.get(0),
            )?;
            if taken {
                // Dropping the transaction rolls back the purge as well; the
                // next attempt purges again.
                return Ok(false);
            }
        }

        for key in keys {
            tx.execute(
                "INSERT INTO lock_table (lock_key, holder, expires_at) VALUES (?1, ?2, ?3)",
                params![key, holder, expires_at],
            )?;
        }

        match tx.commit() {
            Ok(()) => Ok(true),
            Err(e) if is_busy(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl LockRelease for Table {
    fn release(&self, holder: &str, keys: &[String]) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            if let Err(e) = conn.execute(
                "DELETE FROM lock_table WHERE lock_key = ?1 AND holder = ?2",
                params![key, holder],
            ) {
                // The lease expiry reclaims the row eventually.
                tracing::warn!(key = %key, holder = %holder, error = %e, "failed to release lock row");
            }
        }
    }
}

/// Lock manager for jobs spread over several processes
///
/// All processes must open the same database file. The lease must outlast
/// the longest merge unit, or a slow holder's keys can be reclaimed.
#[derive(Clone)]
pub struct SqliteLockManager {
    table: Arc<Table>,
}

impl SqliteLockManager {
    /// Open or create the lock table at the given path
    pub fn open(path: impl AsRef<Path>, lease: Duration) -> Result<Self, LockError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| LockError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, lease)
    }

    /// Create an in-memory lock table (single process, useful for testing)
    pub fn open_in_memory(lease: Duration) -> Result<Self, LockError> {
        Self::from_connection(Connection::open_in_memory()?, lease)
    }

    fn from_connection(conn: Connection, lease: Duration) -> Result<Self, LockError> {
        // A zero lease expires every row as it is written.
        if lease.is_zero() {
            return Err(LockError::ZeroLease);
        }
        Table::init_schema(&conn)?;
        Ok(Self {
            table: Arc::new(Table {
                conn: Mutex::new(conn),
                lease,
                counters: LockCounters::default(),
            }),
        })
    }

    /// Number of live (unexpired) rows
    pub fn held_count(&self) -> Result<usize, LockError> {
        let conn = self.table.conn.lock().map_err(|_| LockError::Poisoned)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM lock_table WHERE expires_at > ?1",
            params![Utc::now().timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[async_trait]
impl LockManager for SqliteLockManager {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn acquire(
        &self,
        set: &LockSet,
        options: &AcquireOptions,
    ) -> Result<LockGuard, LockError> {
        set.validate()?;
        let keys: Vec<String> = set.ordered_keys().map(str::to_owned).collect();
        let holder = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = options.timeout.map(|t| started + t);
        let mut poll = INITIAL_POLL;
        let mut waited = false;

        loop {
            if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                self.table.counters.cancelled();
                return Err(LockError::Cancelled);
            }

            if self.table.try_take(&holder, &keys)? {
                self.table.counters.granted(waited);
                let releaser: Arc<dyn LockRelease> = self.table.clone();
                return Ok(LockGuard::new(holder, keys, releaser));
            }
            waited = true;

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
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
            poll = (poll * 2).min(MAX_POLL);
        }
    }

    fn stats(&self) -> LockStats {
        self.table.counters.snapshot()
    }

    fn lease(&self) -> Option<Duration> {
        Some(self.table.lease)
    }
}
