//! `SQLite`-backed implementation of [`StateStore`].
//!
//! Uses a bounded `sqlx` connection pool; every write is either an
//! insert-if-absent or an upsert, so no explicit locking is needed.

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use cdnarchive_core::{DateKey, EntityRef};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::backend::{ProcessingRecord, ProcessingStatus, StateStore};
use crate::error::{Result, StateError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS processing_state (
    source TEXT NOT NULL,
    date_key TEXT NOT NULL,
    status TEXT NOT NULL,
    archive_path TEXT NOT NULL,
    committed_at TEXT NOT NULL,
    PRIMARY KEY (source, date_key)
);

CREATE TABLE IF NOT EXISTS identifier_cache (
    content_hash TEXT PRIMARY KEY,
    entity_table TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_processing_state_status ON processing_state (source, status);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateStore::open`] for file-backed persistence or
/// [`SqliteStateStore::in_memory`] for tests.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open or create a store at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the directory, pool or schema cannot be set up.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(StateError::database("opening database"))?;

        let store = Self { pool };
        store.init_schema().await?;

        info!(path = %path.display(), "State store opened");
        Ok(store)
    }

    /// Single-connection in-memory store; the database lives as long as the pool.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the pool or schema cannot be set up.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StateError::database("parsing in-memory url"))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StateError::database("opening in-memory database"))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_TABLES)
            .execute(&self.pool)
            .await
            .map_err(StateError::database("creating tables"))?;
        debug!("State store schema initialized");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn decode_record(row: &SqliteRow) -> Result<ProcessingRecord> {
        let invalid = |reason: String| StateError::InvalidRow {
            table: "processing_state",
            reason,
        };
        let get = |column: &'static str| -> Result<String> {
            row.try_get::<String, _>(column)
                .map_err(StateError::database("decoding processing_state"))
        };

        let raw_key = get("date_key")?;
        let date_key = raw_key
            .parse::<DateKey>()
            .map_err(|e| invalid(format!("date_key '{raw_key}': {e}")))?;
        let raw_status = get("status")?;
        let status = ProcessingStatus::parse(&raw_status)
            .ok_or_else(|| invalid(format!("unknown status '{raw_status}'")))?;
        let raw_committed = get("committed_at")?;
        let committed_at = DateTime::parse_from_rfc3339(&raw_committed)
            .map_err(|e| invalid(format!("committed_at '{raw_committed}': {e}")))?
            .with_timezone(&Utc);

        Ok(ProcessingRecord {
            source: get("source")?,
            date_key,
            status,
            archive_path: get("archive_path")?,
            committed_at,
        })
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn processed_date_keys(&self, source: &str) -> Result<BTreeSet<DateKey>> {
        let rows = sqlx::query(
            "SELECT date_key FROM processing_state WHERE source = ? AND status = ?",
        )
        .bind(source)
        .bind(ProcessingStatus::Downloaded.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StateError::database("listing processed partitions"))?;

        let mut keys = BTreeSet::new();
        for row in rows {
            let raw: String = row
                .try_get("date_key")
                .map_err(StateError::database("decoding processing_state"))?;
            match raw.parse::<DateKey>() {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(e) => warn!(source, date_key = %raw, error = %e, "Ignoring unparseable state row"),
            }
        }
        Ok(keys)
    }

    async fn record_processed(&self, record: &ProcessingRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO processing_state \
             (source, date_key, status, archive_path, committed_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.source)
        .bind(record.date_key.to_string())
        .bind(record.status.as_str())
        .bind(&record.archive_path)
        .bind(record.committed_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StateError::database("inserting processing state"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn processing_record(
        &self,
        source: &str,
        date_key: DateKey,
    ) -> Result<Option<ProcessingRecord>> {
        let row = sqlx::query(
            "SELECT source, date_key, status, archive_path, committed_at \
             FROM processing_state WHERE source = ? AND date_key = ?",
        )
        .bind(source)
        .bind(date_key.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StateError::database("reading processing state"))?;

        row.as_ref().map(Self::decode_record).transpose()
    }

    async fn load_identifiers(&self) -> Result<Vec<(String, EntityRef)>> {
        let rows = sqlx::query("SELECT content_hash, entity_table, entity_id FROM identifier_cache")
            .fetch_all(&self.pool)
            .await
            .map_err(StateError::database("loading identifier cache"))?;

        rows.iter()
            .map(|row| {
                let decode = StateError::database("decoding identifier_cache");
                let hash: String = row.try_get("content_hash").map_err(&decode)?;
                let table: String = row.try_get("entity_table").map_err(&decode)?;
                let id: String = row.try_get("entity_id").map_err(&decode)?;
                Ok((hash, EntityRef::new(table, id)))
            })
            .collect()
    }

    async fn upsert_identifiers(&self, entries: &[(String, EntityRef)]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StateError::database("starting identifier upsert"))?;

        let mut affected = 0;
        for (hash, entity) in entries {
            let result = sqlx::query(
                "INSERT INTO identifier_cache (content_hash, entity_table, entity_id, updated_at) \
                 VALUES (?, ?, ?, datetime('now')) \
                 ON CONFLICT(content_hash) DO UPDATE SET \
                 entity_table = excluded.entity_table, \
                 entity_id = excluded.entity_id, \
                 updated_at = excluded.updated_at",
            )
            .bind(hash)
            .bind(&entity.table)
            .bind(&entity.id)
            .execute(&mut *tx)
            .await
            .map_err(StateError::database("upserting identifier"))?;
            affected += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(StateError::database("committing identifier upsert"))?;

        debug!(entries = entries.len(), "Upserted identifier cache entries");
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> DateKey {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn commit_row_is_written_exactly_once() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let record = ProcessingRecord::downloaded("web", key("20240101"), "archive/web/20240101.jsonl.gz");

        assert!(store.record_processed(&record).await.unwrap());
        assert!(!store.record_processed(&record).await.unwrap());

        let stored = store
            .processing_record("web", key("20240101"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.archive_path, "archive/web/20240101.jsonl.gz");
        assert_eq!(stored.status, ProcessingStatus::Downloaded);
    }

    #[tokio::test]
    async fn processed_keys_are_scoped_by_source() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        for (source, day) in [("web", "20240101"), ("web", "20240103"), ("api", "20240102")] {
            let record = ProcessingRecord::downloaded(source, key(day), "x");
            store.record_processed(&record).await.unwrap();
        }

        let web = store.processed_date_keys("web").await.unwrap();
        assert_eq!(web.into_iter().collect::<Vec<_>>(), vec![key("20240101"), key("20240103")]);
        assert_eq!(store.processed_date_keys("api").await.unwrap().len(), 1);
        assert!(store.processed_date_keys("other").await.unwrap().is_empty());
        assert!(store.processing_record("api", key("20240101")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn identifier_upsert_is_idempotent() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let entries = vec![
            ("h1".to_string(), EntityRef::new("videos", "1")),
            ("h2".to_string(), EntityRef::new("photos", "2")),
        ];
        store.upsert_identifiers(&entries).await.unwrap();
        store.upsert_identifiers(&entries).await.unwrap();
        store
            .upsert_identifiers(&[("h1".to_string(), EntityRef::new("videos", "9"))])
            .await
            .unwrap();

        let mut loaded = store.load_identifiers().await.unwrap();
        loaded.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            loaded,
            vec![
                ("h1".to_string(), EntityRef::new("videos", "9")),
                ("h2".to_string(), EntityRef::new("photos", "2")),
            ]
        );
        assert_eq!(store.upsert_identifiers(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        let store = SqliteStateStore::open(&path, 2).await.unwrap();
        store
            .record_processed(&ProcessingRecord::downloaded("web", key("20240101"), "a"))
            .await
            .unwrap();
        store.close().await;

        let reopened = SqliteStateStore::open(&path, 2).await.unwrap();
        assert!(reopened
            .processed_date_keys("web")
            .await
            .unwrap()
            .contains(&key("20240101")));
    }
}
