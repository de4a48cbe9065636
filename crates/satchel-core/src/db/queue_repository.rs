//! Durable retry queue repository implementation

use crate::error::{Error, Result};
use crate::models::{OperationKind, QueuedOperation, Snapshot, SyncOperation};
use libsql::{params, Connection, Row};

/// Trait for durable storage of queued sync operations (async)
#[allow(async_fn_in_trait)]
pub trait QueueRepository {
    /// Create the backing table if it is missing and verify it is readable
    async fn ensure_table(&self) -> Result<()>;

    /// Insert or replace an operation
    async fn save(&self, queued: &QueuedOperation) -> Result<()>;

    /// Delete an operation by id
    async fn delete(&self, id: &str) -> Result<()>;

    /// Operations eligible at `now_ms`, oldest first
    async fn list_due(&self, now_ms: i64) -> Result<Vec<QueuedOperation>>;

    /// Every stored operation, oldest first
    async fn list_all(&self) -> Result<Vec<QueuedOperation>>;

    /// Delete every stored operation
    async fn clear(&self) -> Result<u64>;
}

/// libSQL implementation of `QueueRepository`
pub struct LibSqlQueueRepository<'a> {
    conn: &'a Connection,
}

const SELECT_COLUMNS: &str = "id, kind, table_name, record_id, payload, tier, retry_count, \
                              next_retry_at, last_error, created_at";

impl<'a> LibSqlQueueRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn list_where(&self, filter: &str, params: Vec<libsql::Value>) -> Result<Vec<QueuedOperation>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_queue {filter} ORDER BY created_at ASC, id ASC");
        let mut rows = self.conn.query(&sql, params).await?;

        let mut operations = Vec::new();
        while let Some(row) = rows.next().await? {
            match Self::parse_operation(&row) {
                Ok(queued) => operations.push(queued),
                Err(error) => {
                    tracing::warn!("Skipping unreadable queued operation: {error}");
                }
            }
        }
        Ok(operations)
    }

    /// Parse a queued operation from a database row
    fn parse_operation(row: &Row) -> Result<QueuedOperation> {
        let id: String = row.get(0)?;
        let kind: String = row.get(1)?;
        let table_name: String = row.get(2)?;
        let payload: String = row.get(4)?;
        let tier: String = row.get(5)?;
        let retry_count: i64 = row.get(6)?;

        let operation = SyncOperation {
            id: id
                .parse()
                .map_err(|_| Error::InvalidInput(format!("Invalid operation ID: {id}")))?,
            kind: kind.parse::<OperationKind>()?,
            entity: table_name.parse()?,
            record_id: row.get(3)?,
            payload: serde_json::from_str::<Snapshot>(&payload)?,
            created_at: row.get(9)?,
        };

        Ok(QueuedOperation {
            operation,
            tier: tier.parse()?,
            retry_count: u32::try_from(retry_count).unwrap_or_default(),
            next_retry_at: row.get::<Option<i64>>(7)?,
            last_error: row.get::<Option<String>>(8)?,
        })
    }
}

impl QueueRepository for LibSqlQueueRepository<'_> {
    async fn ensure_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS sync_queue (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    record_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    tier TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    next_retry_at INTEGER,
                    last_error TEXT,
                    created_at INTEGER NOT NULL
                )",
                (),
            )
            .await?;

        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM sync_queue", ())
            .await?;
        while rows.next().await?.is_some() {}
        Ok(())
    }

    async fn save(&self, queued: &QueuedOperation) -> Result<()> {
        let operation = &queued.operation;
        let payload = serde_json::to_string(&operation.payload)?;

        self.conn
            .execute(
                "INSERT INTO sync_queue (
                    id, kind, table_name, record_id, payload, tier,
                    retry_count, next_retry_at, last_error, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    payload = excluded.payload,
                    tier = excluded.tier,
                    retry_count = excluded.retry_count,
                    next_retry_at = excluded.next_retry_at,
                    last_error = excluded.last_error",
                params![
                    operation.id.as_str(),
                    operation.kind.as_str(),
                    operation.entity.table_name(),
                    operation.record_id.as_str(),
                    payload,
                    queued.tier.as_str(),
                    i64::from(queued.retry_count),
                    queued.next_retry_at,
                    queued.last_error.clone(),
                    operation.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
            .await?;
        Ok(())
    }

    async fn list_due(&self, now_ms: i64) -> Result<Vec<QueuedOperation>> {
        self.list_where(
            "WHERE next_retry_at IS NULL OR next_retry_at <= ?",
            vec![libsql::Value::Integer(now_ms)],
        )
        .await
    }

    async fn list_all(&self) -> Result<Vec<QueuedOperation>> {
        self.list_where("", Vec::new()).await
    }

    async fn clear(&self) -> Result<u64> {
        Ok(self.conn.execute("DELETE FROM sync_queue", ()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierPolicy;
    use crate::db::Database;
    use crate::models::{EntityKind, Tier};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn queued(record_id: &str) -> QueuedOperation {
        let payload = json!({"id": record_id, "is_final": true})
            .as_object()
            .unwrap()
            .clone();
        QueuedOperation::new(
            SyncOperation::push(EntityKind::Attempt, record_id, payload),
            Tier::Critical,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_and_list_round_trips() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlQueueRepository::new(db.connection());
        repo.ensure_table().await.unwrap();

        let op = queued("a1");
        repo.save(&op).await.unwrap();

        let all = repo.list_all().await.unwrap();
        assert_eq!(all, vec![op]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn list_due_skips_backed_off_operations() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlQueueRepository::new(db.connection());
        let policy = TierPolicy::new(10, 3, vec![Duration::from_secs(60)]);

        let ready = queued("ready");
        let waiting = queued("waiting").with_failure("timeout", &policy, 1_000);
        repo.save(&ready).await.unwrap();
        repo.save(&waiting).await.unwrap();

        let due = repo.list_due(2_000).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].operation.record_id, "ready");

        assert_eq!(repo.list_due(61_000).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_replaces_retry_bookkeeping() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlQueueRepository::new(db.connection());
        let policy = TierPolicy::new(10, 3, vec![Duration::from_secs(1)]);

        let op = queued("a1");
        repo.save(&op).await.unwrap();
        let failed = op.with_failure("boom", &policy, 0);
        repo.save(&failed).await.unwrap();

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].retry_count, 1);
        assert_eq!(all[0].last_error.as_deref(), Some("boom"));

        repo.delete(&op.operation.id.as_str()).await.unwrap();
        assert!(repo.list_all().await.unwrap().is_empty());
    }
}
