//! Entity record repository implementation

use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{snapshot_id, ColumnKind, EntityKind, Snapshot};
use crate::util::parse_timestamp_ms;
use libsql::Connection;

/// Trait for typed access to the synchronized entity tables (async)
#[allow(async_fn_in_trait)]
pub trait RecordRepository {
    /// Get a record by id
    async fn get(&self, entity: EntityKind, id: &str) -> Result<Option<Snapshot>>;

    /// Insert or replace a record; `synced` is ignored for reference tables
    async fn upsert(&self, entity: EntityKind, snapshot: &Snapshot, synced: bool) -> Result<()>;

    /// Unsynchronized rows of a pushable table, oldest change first.
    ///
    /// `is_final` narrows attempts to submitted (`Some(true)`) or in-progress
    /// (`Some(false)`) rows.
    async fn list_unsynced(
        &self,
        entity: EntityKind,
        is_final: Option<bool>,
    ) -> Result<Vec<Snapshot>>;

    /// Flag a row as synchronized if it still carries `updated_at`
    async fn mark_synced(&self, entity: EntityKind, id: &str, updated_at: Option<i64>)
        -> Result<bool>;

    /// Number of rows in a table
    async fn count(&self, entity: EntityKind) -> Result<u64>;

    /// Number of unsynchronized rows across every pushable table
    async fn count_unsynced(&self) -> Result<u64>;
}

/// libSQL implementation of `RecordRepository`
pub struct LibSqlRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn select(
        &self,
        entity: EntityKind,
        filter: &str,
        params: Vec<libsql::Value>,
    ) -> Result<Vec<Snapshot>> {
        let rows = self.conn.query(&select_sql(entity, filter), params).await?;
        read_snapshots(entity, rows).await
    }

    async fn count_where(&self, entity: EntityKind, filter: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {} {filter}", entity.table_name());
        let mut rows = self.conn.query(&sql, ()).await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

impl RecordRepository for LibSqlRecordRepository<'_> {
    async fn get(&self, entity: EntityKind, id: &str) -> Result<Option<Snapshot>> {
        let mut records = self
            .select(entity, "WHERE id = ?", vec![libsql::Value::Text(id.to_string())])
            .await?;
        Ok(records.pop())
    }

    async fn upsert(&self, entity: EntityKind, snapshot: &Snapshot, synced: bool) -> Result<()> {
        let (sql, params) = upsert_statement(entity, snapshot, Some(synced))?;
        self.conn.execute(&sql, params).await?;
        Ok(())
    }

    async fn list_unsynced(
        &self,
        entity: EntityKind,
        is_final: Option<bool>,
    ) -> Result<Vec<Snapshot>> {
        if !entity.is_pushable() {
            return Ok(Vec::new());
        }

        let filter = match (entity, is_final) {
            (EntityKind::Attempt, Some(true)) => "WHERE synced = 0 AND is_final = 1",
            (EntityKind::Attempt, Some(false)) => "WHERE synced = 0 AND is_final = 0",
            _ => "WHERE synced = 0",
        };
        let filter = format!("{filter} ORDER BY updated_at ASC, id ASC");
        self.select(entity, &filter, Vec::new()).await
    }

    async fn mark_synced(
        &self,
        entity: EntityKind,
        id: &str,
        updated_at: Option<i64>,
    ) -> Result<bool> {
        if !entity.is_pushable() {
            return Ok(false);
        }

        let sql = format!(
            "UPDATE {} SET synced = 1 WHERE id = ? AND updated_at IS ?",
            entity.table_name()
        );
        let params = vec![
            libsql::Value::Text(id.to_string()),
            updated_at.map_or(libsql::Value::Null, libsql::Value::Integer),
        ];
        let changed = self.conn.execute(&sql, params).await?;
        Ok(changed > 0)
    }

    async fn count(&self, entity: EntityKind) -> Result<u64> {
        self.count_where(entity, "").await
    }

    async fn count_unsynced(&self) -> Result<u64> {
        let mut total = 0;
        for entity in EntityKind::PUSHABLE {
            total += self.count_where(entity, "WHERE synced = 0").await?;
        }
        Ok(total)
    }
}

/// `SELECT` of every shared column of a table followed by `filter`.
pub fn select_sql(entity: EntityKind, filter: &str) -> String {
    let columns = entity
        .columns()
        .iter()
        .map(|column| column.name)
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {columns} FROM {} {filter}", entity.table_name())
}

/// Read rows produced by [`select_sql`] into normalized snapshots.
pub async fn read_snapshots(entity: EntityKind, mut rows: libsql::Rows) -> Result<Vec<Snapshot>> {
    let mut records = Vec::new();
    while let Some(row) = rows.next().await? {
        let mut raw = Snapshot::new();
        for (idx, column) in (0_i32..).zip(entity.columns()) {
            raw.insert(column.name.to_string(), json_value(row.get_value(idx)?));
        }
        records.push(entity.normalize(&raw));
    }
    Ok(records)
}

/// Build an idempotent upsert for a snapshot.
///
/// `synced` adds the local-only flag column for pushable tables; pass `None`
/// when writing to the remote store.
pub fn upsert_statement(
    entity: EntityKind,
    snapshot: &Snapshot,
    synced: Option<bool>,
) -> Result<(String, Vec<libsql::Value>)> {
    if snapshot_id(snapshot).is_none() {
        return Err(Error::InvalidInput(format!(
            "{entity} record without an id cannot be written"
        )));
    }

    let normalized = entity.normalize(snapshot);
    let mut names = Vec::with_capacity(entity.columns().len() + 1);
    let mut params = Vec::with_capacity(entity.columns().len() + 1);
    for column in entity.columns() {
        names.push(column.name);
        params.push(sql_value(column.kind, &normalized[column.name]));
    }
    if let Some(synced) = synced.filter(|_| entity.is_pushable()) {
        names.push("synced");
        params.push(libsql::Value::Integer(i64::from(synced)));
    }

    let placeholders = vec!["?"; names.len()].join(", ");
    let updates = names
        .iter()
        .filter(|name| **name != "id")
        .map(|name| format!("{name} = excluded.{name}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT(id) DO UPDATE SET {updates}",
        entity.table_name(),
        names.join(", "),
    );
    Ok((sql, params))
}

/// Convert a snapshot value to its stored representation.
#[allow(clippy::cast_possible_truncation)]
pub fn sql_value(kind: ColumnKind, value: &Value) -> libsql::Value {
    match (kind, value) {
        (_, Value::Null) => libsql::Value::Null,
        (ColumnKind::Text, Value::String(text)) => libsql::Value::Text(text.clone()),
        (ColumnKind::Boolean, value) => {
            libsql::Value::Integer(i64::from(crate::util::value_is_truthy(Some(value))))
        }
        (ColumnKind::Timestamp, value) => {
            parse_timestamp_ms(Some(value)).map_or(libsql::Value::Null, libsql::Value::Integer)
        }
        (ColumnKind::Integer, Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))
            .map_or(libsql::Value::Null, libsql::Value::Integer),
        (ColumnKind::Integer, Value::Bool(flag)) => libsql::Value::Integer(i64::from(*flag)),
        (ColumnKind::Json, value) => libsql::Value::Text(value.to_string()),
        (_, value) => libsql::Value::Text(value.to_string()),
    }
}

/// Convert a stored value to JSON.
pub fn json_value(value: libsql::Value) -> Value {
    match value {
        libsql::Value::Null => Value::Null,
        libsql::Value::Integer(number) => Value::from(number),
        libsql::Value::Real(number) => {
            serde_json::Number::from_f64(number).map_or(Value::Null, Value::Number)
        }
        libsql::Value::Text(text) => Value::String(text),
        libsql::Value::Blob(bytes) => Value::Array(bytes.into_iter().map(Value::from).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn attempt(id: &str, is_final: bool, updated_at: i64) -> Snapshot {
        json!({
            "id": id,
            "learner_id": "l1",
            "quiz_id": "q1",
            "answers": {"q1": "a"},
            "score": null,
            "is_final": is_final,
            "completed_at": null,
            "created_at": 1,
            "updated_at": updated_at,
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upsert_and_get_round_trips_typed_columns() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlRecordRepository::new(db.connection());

        let record = attempt("a1", true, 10);
        repo.upsert(EntityKind::Attempt, &record, false).await.unwrap();

        let loaded = repo.get(EntityKind::Attempt, "a1").await.unwrap().unwrap();
        assert_eq!(loaded, EntityKind::Attempt.normalize(&record));
        assert_eq!(loaded["answers"], json!({"q1": "a"}));
        assert_eq!(loaded["is_final"], json!(true));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn list_unsynced_filters_by_finality() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlRecordRepository::new(db.connection());

        repo.upsert(EntityKind::Attempt, &attempt("final", true, 1), false)
            .await
            .unwrap();
        repo.upsert(EntityKind::Attempt, &attempt("draft", false, 2), false)
            .await
            .unwrap();
        repo.upsert(EntityKind::Attempt, &attempt("done", true, 3), true)
            .await
            .unwrap();

        let critical = repo
            .list_unsynced(EntityKind::Attempt, Some(true))
            .await
            .unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0]["id"], json!("final"));

        let all = repo.list_unsynced(EntityKind::Attempt, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(repo.count_unsynced().await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mark_synced_requires_matching_updated_at() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlRecordRepository::new(db.connection());
        repo.upsert(EntityKind::Attempt, &attempt("a1", false, 5), false)
            .await
            .unwrap();

        assert!(!repo
            .mark_synced(EntityKind::Attempt, "a1", Some(4))
            .await
            .unwrap());
        assert!(repo
            .mark_synced(EntityKind::Attempt, "a1", Some(5))
            .await
            .unwrap());
        assert_eq!(repo.count_unsynced().await.unwrap(), 0);
    }

    #[test]
    fn upsert_statement_rejects_missing_id() {
        let snapshot = json!({"title": "untitled"}).as_object().unwrap().clone();
        assert!(upsert_statement(EntityKind::Quiz, &snapshot, None).is_err());
    }

    #[test]
    fn upsert_statement_skips_synced_for_reference_tables() {
        let snapshot = json!({"id": "q1", "title": "Rocks"}).as_object().unwrap().clone();
        let (sql, params) = upsert_statement(EntityKind::Quiz, &snapshot, Some(true)).unwrap();
        assert!(!sql.contains("synced"));
        assert_eq!(params.len(), EntityKind::Quiz.columns().len());
    }
}
