//! SqliteVectorStore: persistent vector records in a plain SQLite table
//!
//! Each workspace is a partition of the same table, keyed by
//! `(workspace, id)`. Embeddings are stored as little-endian f32 blobs.
//! Uses its own database connection (WAL mode) to avoid contention with
//! the graph store connection.

use super::traits::{
    validate_key, OpenStore, StorageError, StorageResult, VectorBackend, VectorRecord,
};
use crate::graph::Workspace;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
}

pub(super) fn encode(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(super) fn decode(blob: &[u8]) -> StorageResult<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(StorageError::Validation(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

impl SqliteVectorStore {
    fn from_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS vector_records (
                workspace TEXT NOT NULL,
                id TEXT NOT NULL,
                dimensions INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                content TEXT NOT NULL,
                PRIMARY KEY (workspace, id)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl OpenStore for SqliteVectorStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }
}

#[async_trait]
impl VectorBackend for SqliteVectorStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.conn().query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
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
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(StorageError::Validation(format!(
                "non-finite value in embedding for {}",
                id
            )));
        }

        self.conn().execute(
            r#"
            INSERT INTO vector_records (workspace, id, dimensions, embedding, content)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(workspace, id) DO UPDATE SET
                dimensions = excluded.dimensions,
                embedding = excluded.embedding,
                content = excluded.content
            "#,
            params![
                workspace.as_str(),
                id,
                embedding.len() as i64,
                encode(embedding),
                text
            ],
        )?;
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
                "SELECT embedding, content FROM vector_records WHERE workspace = ?1 AND id = ?2",
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
            "SELECT COUNT(*) FROM vector_records WHERE workspace = ?1",
            params![workspace.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_and_read_back() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        let w = Workspace::new("w1").unwrap();
        store
            .upsert_vector("ent-1", &w, &[0.5, -0.25, 1.0], "Acme\nmaker")
            .await
            .unwrap();
        store
            .upsert_vector("ent-1", &w, &[0.0, 1.0, 0.0], "Acme\nbuilder")
            .await
            .unwrap();

        let record = store.get_vector("ent-1", &w).await.unwrap().unwrap();
        assert_eq!(record.embedding, vec![0.0, 1.0, 0.0]);
        assert_eq!(record.text, "Acme\nbuilder");
        assert_eq!(store.count(&w).await.unwrap(), 1);

        let other = Workspace::new("w2").unwrap();
        assert!(store.get_vector("ent-1", &other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_nan_embedding() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        let w = Workspace::new("w1").unwrap();
        let err = store
            .upsert_vector("ent-1", &w, &[f32::NAN], "x")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[test]
    fn blob_round_trip() {
        let values = [1.5f32, -2.0, 0.125];
        assert_eq!(decode(&encode(&values)).unwrap(), values.to_vec());
        assert!(decode(&[0u8; 5]).is_err());
    }
}
