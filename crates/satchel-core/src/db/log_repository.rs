//! Sync audit log and metadata repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::Result;
use crate::models::SyncLogEntry;
use crate::util::now_ms;
use libsql::{params, Connection, Row};

/// Metadata key of the most recent successful sync
pub const LAST_SYNC_KEY: &str = "last_sync:global";

/// Metadata key of the most recent completed full sync
pub const LAST_FULL_SYNC_KEY: &str = "last_full_sync:global";

/// Trait for the append-only sync audit log and key/value metadata (async)
#[allow(async_fn_in_trait)]
pub trait SyncLogRepository {
    /// Append an entry and return its row id
    async fn append(&self, entry: &SyncLogEntry) -> Result<i64>;

    /// Most recent entries, newest first
    async fn recent(&self, limit: usize) -> Result<Vec<SyncLogEntry>>;

    /// Read a metadata value
    async fn get_metadata(&self, key: &str) -> Result<Option<String>>;

    /// Write a metadata value
    async fn set_metadata(&self, key: &str, value: &str) -> Result<()>;
}

/// libSQL implementation of `SyncLogRepository`
pub struct LibSqlSyncLogRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncLogRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a log entry from a database row
    fn parse_entry(row: &Row) -> Result<SyncLogEntry> {
        let status: String = row.get(4)?;
        Ok(SyncLogEntry {
            id: row.get(0)?,
            operation: row.get(1)?,
            table_name: row.get(2)?,
            record_id: row.get(3)?,
            status: status.parse()?,
            error_message: row.get::<Option<String>>(5)?,
            details: row.get::<Option<String>>(6)?,
            attempted_at: row.get(7)?,
            completed_at: row.get::<Option<i64>>(8)?,
        })
    }
}

impl SyncLogRepository for LibSqlSyncLogRepository<'_> {
    async fn append(&self, entry: &SyncLogEntry) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO sync_log (
                    operation, table_name, record_id, status,
                    error_message, details, attempted_at, completed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    entry.operation.as_str(),
                    entry.table_name.as_str(),
                    entry.record_id.as_str(),
                    entry.status.as_str(),
                    entry.error_message.clone(),
                    entry.details.clone(),
                    entry.attempted_at,
                    entry.completed_at,
                ],
            )
            .await?;
        Ok(self.conn.last_insert_rowid())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, operation, table_name, record_id, status,
                        error_message, details, attempted_at, completed_at
                 FROM sync_log
                 ORDER BY attempted_at DESC, id DESC
                 LIMIT ?",
                params![limit as i64],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            match Self::parse_entry(&row) {
                Ok(entry) => entries.push(entry),
                Err(error) => tracing::warn!("Skipping unreadable sync log row: {error}"),
            }
        }
        Ok(entries)
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM sync_metadata WHERE key = ?", params![key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_metadata (key, value, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now_ms()],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::SyncLogStatus;

    #[tokio::test(flavor = "multi_thread")]
    async fn append_and_read_recent_entries() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSyncLogRepository::new(db.connection());

        let first = SyncLogEntry::new("push", "quiz_attempts", "a1", SyncLogStatus::Success);
        let second = SyncLogEntry::new("push", "quiz_attempts", "a2", SyncLogStatus::Failed)
            .with_error("remote unavailable")
            .with_details("permanent: retries exhausted");
        let first_id = repo.append(&first).await.unwrap();
        let second_id = repo.append(&second).await.unwrap();
        assert!(second_id > first_id);

        let recent = repo.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].record_id, "a2");
        assert_eq!(recent[0].status, SyncLogStatus::Failed);
        assert_eq!(recent[0].error_message.as_deref(), Some("remote unavailable"));

        assert_eq!(repo.recent(1).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_upserts() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSyncLogRepository::new(db.connection());

        assert_eq!(repo.get_metadata(LAST_FULL_SYNC_KEY).await.unwrap(), None);
        repo.set_metadata(LAST_FULL_SYNC_KEY, "10").await.unwrap();
        repo.set_metadata(LAST_FULL_SYNC_KEY, "20").await.unwrap();
        assert_eq!(
            repo.get_metadata(LAST_FULL_SYNC_KEY).await.unwrap().as_deref(),
            Some("20")
        );
    }
}
