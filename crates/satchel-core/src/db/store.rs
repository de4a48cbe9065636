//! Shared local store handle used by the sync subsystem and the CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::log_repository::{LibSqlSyncLogRepository, SyncLogRepository};
use super::queue_repository::{LibSqlQueueRepository, QueueRepository};
use super::record_repository::{json_value, upsert_statement, LibSqlRecordRepository, RecordRepository};
use super::Database;
use crate::models::{EntityKind, QueuedOperation, Snapshot, SyncLogEntry};
use crate::Result;

/// One statement of a transaction batch
#[derive(Debug, Clone)]
pub struct Statement {
    /// SQL text with `?` placeholders
    pub sql: String,
    /// Positional parameters
    pub params: Vec<libsql::Value>,
}

impl Statement {
    /// Create a statement
    pub fn new(sql: impl Into<String>, params: Vec<libsql::Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Entity-typed upsert of a snapshot into the local table
    pub fn upsert(entity: EntityKind, snapshot: &Snapshot, synced: bool) -> Result<Self> {
        let (sql, params) = upsert_statement(entity, snapshot, Some(synced))?;
        Ok(Self { sql, params })
    }
}

/// Thread-safe handle to the embedded local database.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open a local store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path).await?;
        tracing::debug!("Opened local store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory local store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Filesystem path of the database, if file-backed.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Execute a single statement and return the number of changed rows.
    pub async fn execute(&self, sql: &str, params: Vec<libsql::Value>) -> Result<u64> {
        let db = self.db.lock().await;
        Ok(db.connection().execute(sql, params).await?)
    }

    /// Run a query and return each row as a snapshot keyed by column name.
    pub async fn query(&self, sql: &str, params: Vec<libsql::Value>) -> Result<Vec<Snapshot>> {
        let db = self.db.lock().await;
        let mut rows = db.connection().query(sql, params).await?;

        let names: Vec<String> = (0..rows.column_count())
            .map(|idx| rows.column_name(idx).unwrap_or_default().to_string())
            .collect();

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let mut record = Snapshot::new();
            for (idx, name) in (0_i32..).zip(&names) {
                record.insert(name.clone(), json_value(row.get_value(idx)?));
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Durability checkpoint: flush the write-ahead log to the main file.
    pub async fn checkpoint(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.checkpoint().await
    }

    /// Execute statements atomically under a single lock acquisition.
    pub async fn run_in_transaction(&self, statements: Vec<Statement>) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN TRANSACTION", ()).await?;
        for statement in statements {
            if let Err(e) = conn.execute(&statement.sql, statement.params).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
        }
        if let Err(e) = conn.execute("COMMIT", ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
        Ok(())
    }

    // Entity records

    /// Get a record by id.
    pub async fn get_record(&self, entity: EntityKind, id: &str) -> Result<Option<Snapshot>> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .get(entity, id)
            .await
    }

    /// Insert or replace a record.
    pub async fn upsert_record(
        &self,
        entity: EntityKind,
        snapshot: &Snapshot,
        synced: bool,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .upsert(entity, snapshot, synced)
            .await
    }

    /// Unsynchronized rows of a pushable table.
    pub async fn list_unsynced(
        &self,
        entity: EntityKind,
        is_final: Option<bool>,
    ) -> Result<Vec<Snapshot>> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .list_unsynced(entity, is_final)
            .await
    }

    /// Flag a row as synchronized if it was not modified since it was read.
    pub async fn mark_synced(
        &self,
        entity: EntityKind,
        id: &str,
        updated_at: Option<i64>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .mark_synced(entity, id, updated_at)
            .await
    }

    /// Number of rows in a table.
    pub async fn count_records(&self, entity: EntityKind) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .count(entity)
            .await
    }

    /// Number of local changes not yet pushed.
    pub async fn count_unsynced(&self) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlRecordRepository::new(db.connection())
            .count_unsynced()
            .await
    }

    /// Whether no reference data has been pulled or seeded yet.
    pub async fn reference_data_is_empty(&self) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlRecordRepository::new(db.connection());
        for entity in EntityKind::REFERENCE {
            if repo.count(entity).await? > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // Retry queue

    /// Prepare the durable queue table.
    pub async fn ensure_queue_table(&self) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .ensure_table()
            .await
    }

    /// Persist a queued operation.
    pub async fn save_queued(&self, queued: &QueuedOperation) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).save(queued).await
    }

    /// Delete a queued operation.
    pub async fn delete_queued(&self, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).delete(id).await
    }

    /// Queued operations eligible at `now_ms`.
    pub async fn list_due_queued(&self, now_ms: i64) -> Result<Vec<QueuedOperation>> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .list_due(now_ms)
            .await
    }

    /// Every durable queued operation.
    pub async fn list_queued(&self) -> Result<Vec<QueuedOperation>> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).list_all().await
    }

    /// Delete every durable queued operation.
    pub async fn clear_queued(&self) -> Result<u64> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).clear().await
    }

    // Audit log and metadata

    /// Append an audit log entry.
    pub async fn append_log(&self, entry: &SyncLogEntry) -> Result<i64> {
        let db = self.db.lock().await;
        LibSqlSyncLogRepository::new(db.connection())
            .append(entry)
            .await
    }

    /// Most recent audit log entries.
    pub async fn recent_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let db = self.db.lock().await;
        LibSqlSyncLogRepository::new(db.connection())
            .recent(limit)
            .await
    }

    /// Read a metadata value.
    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        LibSqlSyncLogRepository::new(db.connection())
            .get_metadata(key)
            .await
    }

    /// Write a metadata value.
    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncLogRepository::new(db.connection())
            .set_metadata(key, value)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn learner(id: &str, name: &str) -> Snapshot {
        json!({"id": id, "display_name": name, "updated_at": 1})
            .as_object()
            .unwrap()
            .clone()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn query_returns_rows_keyed_by_column() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .upsert_record(EntityKind::Learner, &learner("l1", "Ada"), false)
            .await
            .unwrap();

        let rows = store
            .query(
                "SELECT id, display_name, synced FROM learners WHERE id = ?",
                vec![libsql::Value::Text("l1".into())],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["display_name"], json!("Ada"));
        assert_eq!(rows[0]["synced"], json!(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transaction_rolls_back_on_failure() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let result = store
            .run_in_transaction(vec![
                Statement::upsert(EntityKind::Learner, &learner("l1", "Ada"), false).unwrap(),
                Statement::new("INSERT INTO no_such_table VALUES (1)", Vec::new()),
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(store.count_records(EntityKind::Learner).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_store_survives_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("satchel.db");

        let store = LocalStore::open_path(&path).await.unwrap();
        store
            .upsert_record(EntityKind::Learner, &learner("l1", "Ada"), false)
            .await
            .unwrap();
        store.checkpoint().await.unwrap();
        drop(store);

        let reopened = LocalStore::open_path(&path).await.unwrap();
        assert_eq!(reopened.db_path(), Some(path.as_path()));
        assert_eq!(reopened.count_unsynced().await.unwrap(), 1);
        assert!(reopened.reference_data_is_empty().await.unwrap());
    }
}
