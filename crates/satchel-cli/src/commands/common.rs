use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use satchel_core::models::{QueuedOperation, SyncLogEntry};
use satchel_core::{LibSqlRemoteStore, LocalStore, RemoteStore, SatchelConfig};
use serde::Serialize;

use crate::error::CliError;

pub const DB_PATH_ENV: &str = "SATCHEL_DB_PATH";
pub const CONFIG_PATH_ENV: &str = "SATCHEL_CONFIG";

#[derive(Debug, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub kind: String,
    pub table_name: String,
    pub record_id: String,
    pub tier: String,
    pub retry_count: u32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub relative_time: String,
}

pub fn queue_to_item(queued: &QueuedOperation, now_ms: i64) -> QueueItem {
    QueueItem {
        id: queued.operation.id.as_str(),
        kind: queued.operation.kind.to_string(),
        table_name: queued.operation.entity.table_name().to_string(),
        record_id: queued.operation.record_id.clone(),
        tier: queued.tier.to_string(),
        retry_count: queued.retry_count,
        next_retry_at: queued.next_retry_at,
        last_error: queued.last_error.clone(),
        created_at: queued.operation.created_at,
        relative_time: format_relative_time(queued.operation.created_at, now_ms),
    }
}

pub fn format_queue_lines(operations: &[QueuedOperation], now_ms: i64) -> Vec<String> {
    operations
        .iter()
        .map(|queued| {
            let mut line = format!(
                "{:<14} {:<19} {}/{}  retries={}  {}",
                queued.tier.as_str(),
                queued.operation.kind.as_str(),
                queued.operation.entity,
                queued.operation.record_id,
                queued.retry_count,
                format_relative_time(queued.operation.created_at, now_ms)
            );
            if let Some(error) = &queued.last_error {
                line.push_str(&format!("  last_error={error}"));
            }
            line
        })
        .collect()
}

pub fn format_log_lines(entries: &[SyncLogEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let mut line = format!(
                "{}  {:<7}  {:<19} {}/{}",
                format_sync_timestamp(entry.attempted_at),
                entry.status.as_str(),
                entry.operation,
                entry.table_name,
                entry.record_id
            );
            if let Some(details) = &entry.details {
                line.push_str(&format!("  {details}"));
            }
            if let Some(error) = &entry.error_message {
                line.push_str(&format!("  error={error}"));
            }
            line
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os(DB_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("satchel")
        .join("satchel.db")
}

pub fn resolve_config_path(cli_config_path: Option<PathBuf>) -> PathBuf {
    cli_config_path
        .or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(default_config_path)
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("satchel")
        .join("config.json")
}

/// Config file (defaults when missing) with environment overrides applied
pub fn load_config(path: &Path) -> Result<SatchelConfig, CliError> {
    let config = SatchelConfig::load(path)?.with_env_overrides();
    config.validate()?;
    Ok(config)
}

pub async fn open_store(path: &Path) -> Result<LocalStore, CliError> {
    Ok(LocalStore::open_path(path).await?)
}

/// Remote store from config, or `None` when no remote is configured
pub async fn connect_remote(
    config: &SatchelConfig,
) -> Result<Option<Arc<dyn RemoteStore>>, CliError> {
    if !config.remote.is_configured() {
        tracing::debug!("No remote store configured");
        return Ok(None);
    }
    let remote = LibSqlRemoteStore::connect(&config.remote).await?;
    Ok(Some(Arc::new(remote)))
}

pub async fn require_remote(config: &SatchelConfig) -> Result<Arc<dyn RemoteStore>, CliError> {
    connect_remote(config)
        .await?
        .ok_or(CliError::SyncNotConfigured)
}
