use std::path::Path;

use satchel_core::db::{LAST_FULL_SYNC_KEY, LAST_SYNC_KEY};
use satchel_core::remote::RemoteDiagnostics;
use satchel_core::{LocalStore, SatchelConfig};
use serde::Serialize;

use crate::commands::common::{connect_remote, format_sync_timestamp, open_store};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusItem {
    pub db_path: String,
    pub pending_local_changes: u64,
    pub queued_operations: usize,
    pub last_sync_at: Option<i64>,
    pub last_full_sync_at: Option<i64>,
    pub remote: Option<RemoteDiagnostics>,
}

pub async fn run_status(
    as_json: bool,
    config: &SatchelConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let mut item = collect_status(&store, db_path).await?;
    if let Some(remote) = connect_remote(config).await? {
        item.remote = Some(remote.connection_diagnostics().await);
    }

    if as_json {
        println!("{}", serde_json::to_string_pretty(&item)?);
        return Ok(());
    }

    for line in format_status_lines(&item) {
        println!("{line}");
    }
    Ok(())
}

pub async fn collect_status(store: &LocalStore, db_path: &Path) -> Result<StatusItem, CliError> {
    let read_timestamp = |value: Option<String>| value.and_then(|value| value.parse::<i64>().ok());

    Ok(StatusItem {
        db_path: db_path.display().to_string(),
        pending_local_changes: store.count_unsynced().await?,
        queued_operations: store.list_queued().await?.len(),
        last_sync_at: read_timestamp(store.get_metadata(LAST_SYNC_KEY).await?),
        last_full_sync_at: read_timestamp(store.get_metadata(LAST_FULL_SYNC_KEY).await?),
        remote: None,
    })
}

pub fn format_status_lines(item: &StatusItem) -> Vec<String> {
    let never = || "never".to_string();
    let mut lines = vec![
        format!("Database:        {}", item.db_path),
        format!("Pending changes: {}", item.pending_local_changes),
        format!("Queued:          {}", item.queued_operations),
        format!(
            "Last sync:       {}",
            item.last_sync_at.map_or_else(never, format_sync_timestamp)
        ),
        format!(
            "Last full sync:  {}",
            item.last_full_sync_at.map_or_else(never, format_sync_timestamp)
        ),
    ];

    match &item.remote {
        Some(remote) if remote.reachable => lines.push(format!(
            "Remote:          {} reachable ({} ms)",
            remote.backend,
            remote.latency_ms.unwrap_or_default()
        )),
        Some(remote) => lines.push(format!(
            "Remote:          {} unreachable: {}",
            remote.backend,
            remote.error.as_deref().unwrap_or("unknown error")
        )),
        None => lines.push("Remote:          not configured".to_string()),
    }
    lines
}
