//! SqliteVecStore: vector records in a sqlite-vec `vec0` virtual table
//!
//! Each workspace gets its own partition via the `workspace TEXT PARTITION
//! KEY` column. vec0 rows are addressed by rowid, so a companion table maps
//! `(workspace, id)` to the current rowid and the embedded text. An upsert
//! replaces the vec0 row and repoints the mapping in one transaction.
//!
//! Uses its own database connection (WAL mode) to avoid contention with
//! the graph store connection.

#[cfg(feature = "embeddings")]
mod inner {
    use crate::graph::Workspace;
    use crate::storage::sqlite_vector::{decode, encode};
    use crate::storage::traits::{
        validate_key, StorageError, StorageResult, VectorBackend, VectorRecord,
    };
    use async_trait::async_trait;
    use rusqlite::{params, Connection, OptionalExtension};
    use sqlite_vec::sqlite3_vec_init;
    use std::path::Path;
    use std::sync::{Mutex, MutexGuard};

    pub struct SqliteVecStore {
        conn: Mutex<Connection>,
        dimensions: usize,
    }

    /// Register the sqlite-vec extension globally (safe under parallel test execution).
    fn register_vec_extension() {
        use std::sync::Once;
        static INIT: Once = Once::new();
        INIT.call_once(|| unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite3_vec_init as *const (),
            )));
        });
    }

    impl SqliteVecStore {
        /// Open a persistent store whose vectors are `dimensions` long.
        pub fn open(path: impl AsRef<Path>, dimensions: usize) -> StorageResult<Self> {
            register_vec_extension();
            if let Some(parent) = path.as_ref().parent() {
                std::fs::create_dir_all(parent)?;
            }
            Self::init_connection(Connection::open(path)?, dimensions)
        }

        pub fn open_in_memory(dimensions: usize) -> StorageResult<Self> {
            register_vec_extension();
            Self::init_connection(Connection::open_in_memory()?, dimensions)
        }

        fn init_connection(conn: Connection, dimensions: usize) -> StorageResult<Self> {
            if dimensions == 0 {
                return Err(StorageError::Validation(
                    "vector dimensions must be at least 1".to_string(),
                ));
            }
            conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA busy_timeout = 5000;
                "#,
            )?;
            conn.execute_batch(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS vec_embeddings USING vec0(\
                     workspace TEXT PARTITION KEY,\
                     embedding float[{}]\
                 );\
                 CREATE TABLE IF NOT EXISTS vec_records (\
                     workspace TEXT NOT NULL,\
                     id TEXT NOT NULL,\
                     vec_rowid INTEGER NOT NULL,\
                     content TEXT NOT NULL,\
                     PRIMARY KEY (workspace, id)\
                 );",
                dimensions
            ))?;
            Ok(Self {
                conn: Mutex::new(conn),
                dimensions,
            })
        }

        /// The dimensionality of vectors stored in this store.
        pub fn dimensions(&self) -> usize {
            self.dimensions
        }

        fn conn(&self) -> MutexGuard<'_, Connection> {
            self.conn.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    #[async_trait]
    impl VectorBackend for SqliteVecStore {
        fn name(&self) -> &str {
            "sqlite-vec"
        }

        async fn health_check(&self) -> StorageResult<()> {
            self.conn()
                .query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))?;
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
            if embedding.len() != self.dimensions {
                return Err(StorageError::Validation(format!(
                    "embedding for {} has {} dimensions, store expects {}",
                    id,
                    embedding.len(),
                    self.dimensions
                )));
            }
            if embedding.iter().any(|v| !v.is_finite()) {
                return Err(StorageError::Validation(format!(
                    "non-finite value in embedding for {}",
                    id
                )));
            }

            let mut conn = self.conn();
            let tx = conn.transaction()?;
            let previous: Option<i64> = tx
                .query_row(
                    "SELECT vec_rowid FROM vec_records WHERE workspace = ?1 AND id = ?2",
                    params![workspace.as_str(), id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(rowid) = previous {
                tx.execute("DELETE FROM vec_embeddings WHERE rowid = ?1", params![rowid])?;
            }
            tx.execute(
                "INSERT INTO vec_embeddings (workspace, embedding) VALUES (?1, ?2)",
                params![workspace.as_str(), encode(embedding)],
            )?;
            let rowid = tx.last_insert_rowid();
            tx.execute(
                r#"
                INSERT INTO vec_records (workspace, id, vec_rowid, content)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(workspace, id) DO UPDATE SET
                    vec_rowid = excluded.vec_rowid,
                    content = excluded.content
                "#,
                params![workspace.as_str(), id, rowid, text],
            )?;
            tx.commit()?;
            Ok(())
        }

        async fn get_vector(
            &self,
            id: &str,
            workspace: &Workspace,
        ) -> StorageResult<Option<VectorRecord>> {
            let row: Option<(Vec<u8>, String)> = self
                .conn()
                .query_row(
                    r#"
                    SELECT v.embedding, r.content
                    FROM vec_records r
                    JOIN vec_embeddings v ON v.rowid = r.vec_rowid
                    WHERE r.workspace = ?1 AND r.id = ?2
                    "#,
                    params![workspace.as_str(), id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((blob, text)) => Ok(Some(VectorRecord {
                    id: id.to_string(),
                    workspace: workspace.clone(),
                    embedding: decode(&blob)?,
                    text,
                })),
                None => Ok(None),
            }
        }

        async fn count(&self, workspace: &Workspace) -> StorageResult<usize> {
            let count: i64 = self.conn().query_row(
                "SELECT COUNT(*) FROM vec_records WHERE workspace = ?1",
                params![workspace.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        }
    }

}

#[cfg(feature = "embeddings")]
pub use inner::SqliteVecStore;
