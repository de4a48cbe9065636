use std::path::Path;

use satchel_core::sync::{ConflictResolver, QueueSummary, RetryQueue};
use satchel_core::util::now_ms;
use satchel_core::SatchelConfig;

use crate::cli::QueueCommands;
use crate::commands::common::{
    format_queue_lines, open_store, queue_to_item, require_remote, QueueItem,
};
use crate::error::CliError;

pub async fn run_queue(
    command: QueueCommands,
    config: &SatchelConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    match command {
        QueueCommands::List { json } => run_queue_list(json, db_path).await,
        QueueCommands::Clear => run_queue_clear(config, db_path).await,
        QueueCommands::Process { json } => run_queue_process(json, config, db_path).await,
    }
}

async fn run_queue_list(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let mut operations = store.list_queued().await?;
    operations.sort_by_key(|queued| queued.operation.created_at);
    let now = now_ms();

    if as_json {
        let json_items = operations
            .iter()
            .map(|queued| queue_to_item(queued, now))
            .collect::<Vec<QueueItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("Retry queue is empty.");
        return Ok(());
    }

    for line in format_queue_lines(&operations, now) {
        println!("{line}");
    }
    Ok(())
}

async fn run_queue_clear(config: &SatchelConfig, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let queue = RetryQueue::new(store, config.sync.tiers.clone());
    queue.initialize().await?;
    let removed = queue.clear_queue().await?;
    println!("Removed {removed} queued operations");
    Ok(())
}

async fn run_queue_process(
    as_json: bool,
    config: &SatchelConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    let remote = require_remote(config).await?;
    let store = open_store(db_path).await?;
    let queue = RetryQueue::new(store.clone(), config.sync.tiers.clone());
    queue.initialize().await?;

    let resolver = ConflictResolver::from_settings(&config.sync);

    let summary = queue
        .process_queue(remote.as_ref(), &store, &resolver)
        .await?;
    queue.cleanup().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", format_queue_summary(&summary));
    }
    Ok(())
}

pub fn format_queue_summary(summary: &QueueSummary) -> String {
    format!(
        "Processed {}: {} succeeded, {} retried, {} abandoned",
        summary.processed, summary.succeeded, summary.retried, summary.abandoned
    )
}
