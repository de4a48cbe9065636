//! Remote libSQL (Turso) store over HTTP

use std::time::{Duration, Instant};

use async_trait::async_trait;
use libsql::{Builder, Connection, Database};

use super::{ReferenceData, RemoteDiagnostics, RemoteStore};
use crate::config::RemoteConfig;
use crate::db::{read_snapshots, select_sql, upsert_statement};
use crate::error::Error;
use crate::models::{EntityKind, Snapshot};
use crate::util::{compact_text, normalize_text_option};
use crate::Result;

/// Default bound on a single remote round trip
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote store backed by a libSQL server.
///
/// The remote tables share their column layout with the local tables, minus
/// the local-only `synced` flag.
pub struct LibSqlRemoteStore {
    url: String,
    // Keeps the underlying database alive for the lifetime of the connection
    _db: Database,
    conn: Connection,
    request_timeout: Duration,
}

impl LibSqlRemoteStore {
    /// Connect using the configured URL and token.
    pub async fn connect(config: &RemoteConfig) -> Result<Self> {
        let url = normalize_text_option(config.url.clone())
            .ok_or_else(|| Error::Config("remote.url is not configured".to_string()))?;
        let auth_token = normalize_text_option(config.auth_token.clone()).unwrap_or_default();

        let db = Builder::new_remote(url.clone(), auth_token).build().await?;
        let conn = db.connect()?;
        tracing::info!("Connected remote store: {url}");

        Ok(Self {
            url,
            _db: db,
            conn,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Override the per-request timeout
    #[must_use]
    pub const fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    async fn bounded<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, libsql::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, future).await {
            Ok(result) => result.map_err(classify_error),
            Err(_) => Err(Error::remote_transient(format!(
                "{operation} timed out after {} ms",
                self.request_timeout.as_millis()
            ))),
        }
    }

    async fn select(
        &self,
        entity: EntityKind,
        filter: &str,
        params: Vec<libsql::Value>,
    ) -> Result<Vec<Snapshot>> {
        let sql = select_sql(entity, filter);
        let rows = self.bounded("select", self.conn.query(&sql, params)).await?;
        read_snapshots(entity, rows).await.map_err(|error| match error {
            Error::LibSql(error) => classify_error(error),
            other => other,
        })
    }

    async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let mut rows = self.bounded("ping", self.conn.query("SELECT 1", ())).await?;
        self.bounded("ping", rows.next()).await?;
        Ok(started.elapsed())
    }
}

/// Map a driver error to a remote error, marking schema and constraint
/// failures as permanent.
fn classify_error(error: libsql::Error) -> Error {
    let message = compact_text(&error.to_string());
    let lowered = message.to_ascii_lowercase();
    let permanent = ["constraint", "no such table", "no such column", "syntax error"]
        .iter()
        .any(|needle| lowered.contains(needle));

    if permanent {
        Error::remote_fatal(message)
    } else {
        Error::remote_transient(message)
    }
}

#[async_trait]
impl RemoteStore for LibSqlRemoteStore {
    async fn is_reachable_now(&self) -> bool {
        self.ping().await.is_ok()
    }

    async fn sync_one_record(&self, entity: EntityKind, snapshot: &Snapshot) -> Result<()> {
        let (sql, params) = upsert_statement(entity, snapshot, None)?;
        self.bounded("upsert", self.conn.execute(&sql, params)).await?;
        tracing::debug!("Upserted remote {entity} record");
        Ok(())
    }

    async fn fetch_record(&self, entity: EntityKind, id: &str) -> Result<Option<Snapshot>> {
        let mut records = self
            .select(entity, "WHERE id = ?", vec![libsql::Value::Text(id.to_string())])
            .await?;
        Ok(records.pop())
    }

    async fn pull_all_reference_data(&self) -> Result<ReferenceData> {
        Ok(ReferenceData {
            quizzes: self.select(EntityKind::Quiz, "ORDER BY id", Vec::new()).await?,
            questions: self
                .select(EntityKind::Question, "ORDER BY quiz_id, position, id", Vec::new())
                .await?,
        })
    }

    async fn count_changes_since(&self, since_ms: Option<i64>) -> Result<u64> {
        let mut total = 0_u64;
        for entity in EntityKind::REFERENCE {
            let (sql, params) = since_ms.map_or_else(
                || (format!("SELECT COUNT(*) FROM {}", entity.table_name()), Vec::new()),
                |since| {
                    (
                        format!("SELECT COUNT(*) FROM {} WHERE updated_at > ?", entity.table_name()),
                        vec![libsql::Value::Integer(since)],
                    )
                },
            );
            let mut rows = self.bounded("count", self.conn.query(&sql, params)).await?;
            if let Some(row) = self.bounded("count", rows.next()).await? {
                let count = row.get::<i64>(0).map_err(classify_error)?;
                total += u64::try_from(count).unwrap_or_default();
            }
        }
        Ok(total)
    }

    async fn connection_diagnostics(&self) -> RemoteDiagnostics {
        let (reachable, latency_ms, error) = match self.ping().await {
            Ok(latency) => (
                true,
                Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)),
                None,
            ),
            Err(error) => (false, None, Some(error.to_string())),
        };
        RemoteDiagnostics {
            backend: self.name().to_string(),
            endpoint: Some(self.url.clone()),
            reachable,
            latency_ms,
            error,
        }
    }

    fn name(&self) -> &'static str {
        "libsql"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_requires_url() {
        let result = LibSqlRemoteStore::connect(&RemoteConfig::default()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn schema_errors_are_permanent() {
        let error = classify_error(libsql::Error::SqliteFailure(1, "no such table: quizzes".into()));
        assert!(!error.is_retryable());

        let error = classify_error(libsql::Error::SqliteFailure(5, "database is locked".into()));
        assert!(error.is_retryable());
    }
}
