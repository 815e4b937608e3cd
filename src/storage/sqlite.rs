//! SQLite graph backend
//!
//! Nodes and edges live in two tables keyed by workspace. Edges are keyed by
//! the normalized endpoint pair, with the stored direction kept in separate
//! columns. Set-valued attributes are stored as JSON text.

use super::traits::{
    validate_key, EdgeAttributes, GraphBackend, NodeAttributes, OpenStore, StorageError,
    StorageResult,
};
use crate::graph::{EdgeKey, Workspace};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed graph store
///
/// Thread-safe via internal mutex on the connection.
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
}

type NodeRow = (String, String, String, String, String, String, String);

impl SqliteGraphStore {
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            -- Enable WAL mode for concurrent reads during writes
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS graph_nodes (
                workspace TEXT NOT NULL,
                name TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                description TEXT NOT NULL,
                fragments_json TEXT NOT NULL,
                source_ids_json TEXT NOT NULL,
                file_paths_json TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (workspace, name)
            );

            CREATE TABLE IF NOT EXISTS graph_edges (
                workspace TEXT NOT NULL,
                node_a TEXT NOT NULL,
                node_b TEXT NOT NULL,
                source_name TEXT NOT NULL,
                target_name TEXT NOT NULL,
                description TEXT NOT NULL,
                fragments_json TEXT NOT NULL,
                keywords_json TEXT NOT NULL,
                weight REAL NOT NULL,
                contributions_json TEXT NOT NULL DEFAULT '{}',
                source_ids_json TEXT NOT NULL,
                file_paths_json TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (workspace, node_a, node_b)
            );

            -- Edge traversal from the second endpoint
            CREATE INDEX IF NOT EXISTS idx_graph_edges_b
                ON graph_edges(workspace, node_b);
            "#,
        )?;
        Ok(())
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves no partial SQLite state behind.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn parse_time(raw: &str) -> StorageResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StorageError::DateParse(e.to_string()))
    }

    fn row_to_node(row: NodeRow) -> StorageResult<(String, NodeAttributes)> {
        let (name, entity_type, description, fragments, source_ids, file_paths, updated_at) = row;
        Ok((
            name,
            NodeAttributes {
                entity_type,
                description,
                description_fragments: serde_json::from_str(&fragments)?,
                source_ids: serde_json::from_str(&source_ids)?,
                file_paths: serde_json::from_str(&file_paths)?,
                updated_at: Self::parse_time(&updated_at)?,
            },
        ))
    }

    #[cfg(test)]
    fn journal_mode(&self) -> StorageResult<String> {
        Ok(self
            .conn()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))?)
    }
}

impl OpenStore for SqliteGraphStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        // Ensure parent directory exists
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
impl GraphBackend for SqliteGraphStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.conn().query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    async fn get_node(
        &self,
        workspace: &Workspace,
        name: &str,
    ) -> StorageResult<Option<NodeAttributes>> {
        let conn = self.conn();
        let row: Option<NodeRow> = conn
            .query_row(
                "SELECT name, entity_type, description, fragments_json, source_ids_json, file_paths_json, updated_at
                 FROM graph_nodes WHERE workspace = ?1 AND name = ?2",
                params![workspace.as_str(), name],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some(row) => Ok(Some(Self::row_to_node(row)?.1)),
            None => Ok(None),
        }
    }

    async fn upsert_node(
        &self,
        workspace: &Workspace,
        name: &str,
        attrs: &NodeAttributes,
    ) -> StorageResult<()> {
        validate_key(workspace, &[name])?;
        let fragments = serde_json::to_string(&attrs.description_fragments)?;
        let source_ids = serde_json::to_string(&attrs.source_ids)?;
        let file_paths = serde_json::to_string(&attrs.file_paths)?;

        self.conn().execute(
            r#"
            INSERT INTO graph_nodes (workspace, name, entity_type, description, fragments_json,
                                     source_ids_json, file_paths_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(workspace, name) DO UPDATE SET
                entity_type = excluded.entity_type,
                description = excluded.description,
                fragments_json = excluded.fragments_json,
                source_ids_json = excluded.source_ids_json,
                file_paths_json = excluded.file_paths_json,
                updated_at = excluded.updated_at
            "#,
            params![
                workspace.as_str(),
                name,
                attrs.entity_type,
                attrs.description,
                fragments,
                source_ids,
                file_paths,
                attrs.updated_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn get_edge(
        &self,
        workspace: &Workspace,
        a: &str,
        b: &str,
    ) -> StorageResult<Option<EdgeAttributes>> {
        let key = EdgeKey::new(a, b);
        let conn = self.conn();
        #[allow(clippy::type_complexity)]
        let row: Option<(String, String, String, String, String, f64, String, String, String, String)> = conn
            .query_row(
                "SELECT source_name, target_name, description, fragments_json, keywords_json,
                        weight, contributions_json, source_ids_json, file_paths_json, updated_at
                 FROM graph_edges WHERE workspace = ?1 AND node_a = ?2 AND node_b = ?3",
                params![workspace.as_str(), key.a, key.b],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                    ))
                },
            )
            .optional()?;

        let Some((source_name, target_name, description, fragments, keywords, weight, contributions, source_ids, file_paths, updated_at)) = row else {
            return Ok(None);
        };

        // Rows written before contributions were tracked hold '{}'
        let weight_contributions: BTreeMap<String, f64> = if contributions.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&contributions)?
        };

        Ok(Some(EdgeAttributes {
            source_name,
            target_name,
            description,
            description_fragments: serde_json::from_str(&fragments)?,
            keywords: serde_json::from_str(&keywords)?,
            weight,
            weight_contributions,
            source_ids: serde_json::from_str(&source_ids)?,
            file_paths: serde_json::from_str(&file_paths)?,
            updated_at: Self::parse_time(&updated_at)?,
        }))
    }

    async fn upsert_edge(
        &self,
        workspace: &Workspace,
        a: &str,
        b: &str,
        attrs: &EdgeAttributes,
    ) -> StorageResult<()> {
        validate_key(workspace, &[a, b])?;
        if !attrs.weight.is_finite() {
            return Err(StorageError::Validation(format!(
                "non-finite weight on {} -- {}",
                a, b
            )));
        }
        let key = EdgeKey::new(a, b);

        self.conn().execute(
            r#"
            INSERT INTO graph_edges (workspace, node_a, node_b, source_name, target_name, description,
                                     fragments_json, keywords_json, weight, contributions_json,
                                     source_ids_json, file_paths_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(workspace, node_a, node_b) DO UPDATE SET
                source_name = excluded.source_name,
                target_name = excluded.target_name,
                description = excluded.description,
                fragments_json = excluded.fragments_json,
                keywords_json = excluded.keywords_json,
                weight = excluded.weight,
                contributions_json = excluded.contributions_json,
                source_ids_json = excluded.source_ids_json,
                file_paths_json = excluded.file_paths_json,
                updated_at = excluded.updated_at
            "#,
            params![
                workspace.as_str(),
                key.a,
                key.b,
                attrs.source_name,
                attrs.target_name,
                attrs.description,
                serde_json::to_string(&attrs.description_fragments)?,
                serde_json::to_string(&attrs.keywords)?,
                attrs.weight,
                serde_json::to_string(&attrs.weight_contributions)?,
                serde_json::to_string(&attrs.source_ids)?,
                serde_json::to_string(&attrs.file_paths)?,
                attrs.updated_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn list_nodes(
        &self,
        workspace: &Workspace,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(String, NodeAttributes)>> {
        let conn = self.conn();
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(
            "SELECT name, entity_type, description, fragments_json, source_ids_json, file_paths_json, updated_at
             FROM graph_nodes WHERE workspace = ?1 ORDER BY name LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![workspace.as_str(), limit], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<Result<Vec<NodeRow>, _>>()?;

        rows.into_iter().map(Self::row_to_node).collect()
    }

    async fn node_count(&self, workspace: &Workspace) -> StorageResult<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM graph_nodes WHERE workspace = ?1",
            params![workspace.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn edge_count(&self, workspace: &Workspace) -> StorageResult<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM graph_edges WHERE workspace = ?1",
            params![workspace.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
