//! SQLite-backed schema store.
//!
//! All DB operations are dispatched via `tokio::task::spawn_blocking` so the
//! Tokio worker thread is never stalled by synchronous SQLite I/O.

use super::{
    EVENT_MODELS_TABLE, EventModelRow, FlushBatch, ModelIdentityRow,
    SCHEMA_VERSIONS_TABLE,
    SchemaStore, SchemaVersionRow, StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params, params_from_iter};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

// ---------------------------------------------------------------------------
// spawn_blocking helper
// ---------------------------------------------------------------------------

/// Spawn a blocking closure that receives a locked `&Connection`.
/// Returns `StoreResult<T>` where `T: Send + 'static`.
macro_rules! db {
    ($conn:expr, $body:expr) => {{
        let conn = Arc::clone(&$conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::Database(format!("poisoned: {e}")))?;
            ($body)(&*guard)
        })
        .await
        .map_err(|e| StoreError::Database(format!("spawn_blocking panic: {e}")))?
    }};
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

/// `?1, ?2, ... ?n`
fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SqliteSchemaStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSchemaStore {
    /// Open (or create) the database file.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Database(e.to_string()))?;
            }
        }
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create in-memory store (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS {EVENT_MODELS_TABLE} (
                seq               INTEGER PRIMARY KEY AUTOINCREMENT,
                id                TEXT    NOT NULL UNIQUE,
                write_key         TEXT    NOT NULL,
                event_type        TEXT    NOT NULL,
                event_identifier  TEXT    NOT NULL,
                schema            TEXT    NOT NULL,
                metadata          TEXT    NOT NULL,
                private_data      TEXT    NOT NULL,
                last_seen         TEXT    NOT NULL,
                total_count       INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_event_models_write_key
                ON {EVENT_MODELS_TABLE}(write_key);

            CREATE TABLE IF NOT EXISTS {SCHEMA_VERSIONS_TABLE} (
                seq               INTEGER PRIMARY KEY AUTOINCREMENT,
                id                TEXT    NOT NULL UNIQUE,
                event_model_id    TEXT    NOT NULL,
                schema_hash       TEXT    NOT NULL,
                schema            TEXT    NOT NULL,
                metadata          TEXT    NOT NULL,
                private_data      TEXT    NOT NULL,
                first_seen        TEXT    NOT NULL,
                last_seen         TEXT    NOT NULL,
                total_count       INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_schema_versions_model
                ON {SCHEMA_VERSIONS_TABLE}(event_model_id);
            "#
        ))
        .map_err(db_err)?;
        Ok(())
    }
}

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<EventModelRow> {
    let last_seen: String = row.get(7)?;
    Ok(EventModelRow {
        id: row.get(0)?,
        write_key: row.get(1)?,
        event_type: row.get(2)?,
        event_identifier: row.get(3)?,
        schema: row.get(4)?,
        metadata: row.get(5)?,
        private_data: row.get(6)?,
        last_seen: parse_ts(&last_seen)?,
        total_count: row.get(8)?,
    })
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<ModelIdentityRow> {
    let last_seen: String = row.get(4)?;
    Ok(ModelIdentityRow {
        id: row.get(0)?,
        write_key: row.get(1)?,
        event_type: row.get(2)?,
        event_identifier: row.get(3)?,
        last_seen: parse_ts(&last_seen)?,
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<SchemaVersionRow> {
    let first_seen: String = row.get(6)?;
    let last_seen: String = row.get(7)?;
    Ok(SchemaVersionRow {
        id: row.get(0)?,
        event_model_id: row.get(1)?,
        schema_hash: row.get(2)?,
        schema: row.get(3)?,
        metadata: row.get(4)?,
        private_data: row.get(5)?,
        first_seen: parse_ts(&first_seen)?,
        last_seen: parse_ts(&last_seen)?,
        total_count: row.get(8)?,
    })
}

/// Run `DELETE FROM {table} WHERE {column} IN (...)` for a possibly empty id list.
fn delete_in(
    conn: &Connection,
    table: &str,
    column: &str,
    ids: &[&str],
) -> rusqlite::Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM {table} WHERE {column} IN ({})",
        placeholders(ids.len())
    );
    conn.execute(&sql, params_from_iter(ids.iter()))
}

fn apply_batch(conn: &Connection, batch: &FlushBatch) -> rusqlite::Result<()> {
    let model_ids: Vec<&str> = batch
        .models
        .iter()
        .map(|m| m.id.as_str())
        .chain(batch.delete_model_ids.iter().map(String::as_str))
        .collect();
    let dropped_models: Vec<&str> =
        batch.delete_model_ids.iter().map(String::as_str).collect();
    let version_ids: Vec<&str> = batch
        .versions
        .iter()
        .map(|v| v.id.as_str())
        .chain(batch.delete_version_ids.iter().map(String::as_str))
        .collect();

    delete_in(conn, EVENT_MODELS_TABLE, "id", &model_ids)?;
    delete_in(conn, SCHEMA_VERSIONS_TABLE, "event_model_id", &dropped_models)?;
    delete_in(conn, SCHEMA_VERSIONS_TABLE, "id", &version_ids)?;

    if !batch.models.is_empty() {
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT INTO {EVENT_MODELS_TABLE} \
             (id, write_key, event_type, event_identifier, schema, metadata, \
              private_data, last_seen, total_count) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ))?;
        for m in &batch.models {
            stmt.execute(params![
                m.id,
                m.write_key,
                m.event_type,
                m.event_identifier,
                m.schema,
                m.metadata,
                m.private_data,
                m.last_seen.to_rfc3339(),
                m.total_count,
            ])?;
        }
    }

    if !batch.versions.is_empty() {
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT INTO {SCHEMA_VERSIONS_TABLE} \
             (id, event_model_id, schema_hash, schema, metadata, private_data, \
              first_seen, last_seen, total_count) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ))?;
        for v in &batch.versions {
            stmt.execute(params![
                v.id,
                v.event_model_id,
                v.schema_hash,
                v.schema,
                v.metadata,
                v.private_data,
                v.first_seen.to_rfc3339(),
                v.last_seen.to_rfc3339(),
                v.total_count,
            ])?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// SchemaStore impl
// ---------------------------------------------------------------------------

#[async_trait]
impl SchemaStore for SqliteSchemaStore {
    async fn load_models(
        &self,
        ids: Option<&[String]>,
    ) -> StoreResult<Vec<EventModelRow>> {
        let ids: Option<Vec<String>> = ids.map(<[String]>::to_vec);
        db!(self.conn, move |conn: &Connection| {
            let base = format!(
                "SELECT id, write_key, event_type, event_identifier, schema, \
                 metadata, private_data, last_seen, total_count \
                 FROM {EVENT_MODELS_TABLE}"
            );
            let (sql, args) = match ids {
                Some(ids) if ids.is_empty() => return Ok(Vec::new()),
                Some(ids) => (
                    format!("{base} WHERE id IN ({})", placeholders(ids.len())),
                    ids,
                ),
                None => (format!("{base} ORDER BY seq"), Vec::new()),
            };
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), model_from_row)
                .map_err(db_err)?;
            rows.map(|r| r.map_err(db_err)).collect()
        })
    }

    async fn load_model_identities(&self) -> StoreResult<Vec<ModelIdentityRow>> {
        db!(self.conn, |conn: &Connection| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT id, write_key, event_type, event_identifier, last_seen \
                     FROM {EVENT_MODELS_TABLE} ORDER BY seq"
                ))
                .map_err(db_err)?;
            let rows = stmt.query_map([], identity_from_row).map_err(db_err)?;
            rows.map(|r| r.map_err(db_err)).collect()
        })
    }

    async fn load_versions(
        &self,
        model_ids: Option<&[String]>,
    ) -> StoreResult<Vec<SchemaVersionRow>> {
        let model_ids: Option<Vec<String>> = model_ids.map(<[String]>::to_vec);
        db!(self.conn, move |conn: &Connection| {
            let base = format!(
                "SELECT id, event_model_id, schema_hash, schema, metadata, \
                 private_data, first_seen, last_seen, total_count \
                 FROM {SCHEMA_VERSIONS_TABLE}"
            );
            let (sql, args) = match model_ids {
                Some(ids) if ids.is_empty() => return Ok(Vec::new()),
                Some(ids) => (
                    format!(
                        "{base} WHERE event_model_id IN ({}) ORDER BY seq",
                        placeholders(ids.len())
                    ),
                    ids,
                ),
                None => (format!("{base} ORDER BY seq"), Vec::new()),
            };
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), version_from_row)
                .map_err(db_err)?;
            rows.map(|r| r.map_err(db_err)).collect()
        })
    }

    async fn write_batch(&self, batch: FlushBatch) -> StoreResult<()> {
        db!(self.conn, move |conn: &Connection| {
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            // Dropping `tx` without commit rolls back.
            apply_batch(&tx, &batch).map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            debug!(
                models = batch.models.len(),
                versions = batch.versions.len(),
                deleted_models = batch.delete_model_ids.len(),
                deleted_versions = batch.delete_version_ids.len(),
                "flush batch committed"
            );
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn model(id: &str, total: i64) -> EventModelRow {
        EventModelRow {
            id: id.into(),
            write_key: "wk-1".into(),
            event_type: "track".into(),
            event_identifier: format!("event-{id}"),
            schema: r#"{"a":"string"}"#.into(),
            metadata: r#"{"SampledEvents":[],"TotalCount":0}"#.into(),
            private_data: r#"{"FrequencyCounters":[]}"#.into(),
            last_seen: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            total_count: total,
        }
    }

    fn version(id: &str, model_id: &str) -> SchemaVersionRow {
        let ts = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        SchemaVersionRow {
            id: id.into(),
            event_model_id: model_id.into(),
            schema_hash: format!("hash-{id}"),
            schema: r#"{"a":"string"}"#.into(),
            metadata: "{}".into(),
            private_data: "{}".into(),
            first_seen: ts,
            last_seen: ts,
            total_count: 3,
        }
    }

    #[tokio::test]
    async fn test_insert_and_load_round_trip() {
        let store = SqliteSchemaStore::in_memory().unwrap();
        store
            .write_batch(FlushBatch {
                models: vec![model("m1", 7)],
                versions: vec![version("v1", "m1")],
                ..Default::default()
            })
            .await
            .unwrap();

        let models = store.load_models(None).await.unwrap();
        assert_eq!(models, vec![model("m1", 7)]);
        let versions = store.load_versions(None).await.unwrap();
        assert_eq!(versions, vec![version("v1", "m1")]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_row() {
        let store = SqliteSchemaStore::in_memory().unwrap();
        for total in [1, 2, 3] {
            store
                .write_batch(FlushBatch {
                    models: vec![model("m1", total)],
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let models = store.load_models(None).await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].total_count, 3);
    }

    #[tokio::test]
    async fn test_delete_model_cascades_to_versions() {
        let store = SqliteSchemaStore::in_memory().unwrap();
        store
            .write_batch(FlushBatch {
                models: vec![model("m1", 1), model("m2", 1)],
                versions: vec![
                    version("v1", "m1"),
                    version("v2", "m1"),
                    version("v3", "m2"),
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        store
            .write_batch(FlushBatch {
                delete_model_ids: vec!["m1".into()],
                delete_version_ids: vec!["v3".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        let models = store.load_models(None).await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "m2");
        assert!(store.load_versions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filtered_loads() {
        let store = SqliteSchemaStore::in_memory().unwrap();
        store
            .write_batch(FlushBatch {
                models: vec![model("m1", 1), model("m2", 1)],
                versions: vec![version("v1", "m1"), version("v2", "m2")],
                ..Default::default()
            })
            .await
            .unwrap();

        let m = store
            .load_models(Some(&["m2".to_string(), "missing".to_string()]))
            .await
            .unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].id, "m2");

        let v = store.load_versions(Some(&["m1".to_string()])).await.unwrap();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].id, "v1");

        assert!(store.load_models(Some(&[])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let store = SqliteSchemaStore::in_memory().unwrap();
        store
            .write_batch(FlushBatch {
                models: vec![model("m1", 1)],
                ..Default::default()
            })
            .await
            .unwrap();

        // duplicate ids inside one batch violate the UNIQUE constraint after
        // the delete step already ran
        let err = store
            .write_batch(FlushBatch {
                models: vec![model("m1", 5), model("m1", 6)],
                ..Default::default()
            })
            .await;
        assert!(err.is_err());

        let models = store.load_models(None).await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].total_count, 1);
    }

    #[tokio::test]
    async fn test_reopen_file_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("schemas.db");
        {
            let store = SqliteSchemaStore::new(&path).unwrap();
            store
                .write_batch(FlushBatch {
                    models: vec![model("m1", 9)],
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let store = SqliteSchemaStore::new(&path).unwrap();
        let models = store.load_models(None).await.unwrap();
        assert_eq!(models[0].total_count, 9);
    }

    #[tokio::test]
    async fn test_identities_skip_blobs() {
        let store = SqliteSchemaStore::in_memory().unwrap();
        let mut broken = model("m2", 1);
        broken.metadata = "{not json".into();
        store
            .write_batch(FlushBatch {
                models: vec![model("m1", 1), broken],
                ..Default::default()
            })
            .await
            .unwrap();

        let ids = store.load_model_identities().await.unwrap();
        assert_eq!(
            ids,
            vec![
                ModelIdentityRow::from(&model("m1", 1)),
                ModelIdentityRow::from(&model("m2", 1)),
            ]
        );
    }
}
