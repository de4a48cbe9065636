use std::path::Path;
use std::sync::Arc;

use satchel_core::seed::JsonSeedProvider;
use satchel_core::{
    SatchelConfig, SyncCoordinator, SyncOutcome, SyncReport, SyncTrigger, TriggerOptions,
};

use crate::commands::common::{connect_remote, open_store};
use crate::error::CliError;

pub async fn run_sync(
    trigger: SyncTrigger,
    force: bool,
    seed_path: Option<&Path>,
    as_json: bool,
    config: &SatchelConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let remote = connect_remote(config).await?;
    if remote.is_none() {
        tracing::warn!("No remote store configured; sync will be deferred");
    }

    let mut builder = SyncCoordinator::builder(store.clone(), config.clone());
    if let Some(path) = seed_path {
        builder = builder.seeder(Arc::new(JsonSeedProvider::from_path(store, path)));
    }
    let coordinator = builder.build();

    // Startup runs as part of initialize
    coordinator.initialize(remote).await?;
    let report = if trigger == SyncTrigger::Startup {
        None
    } else {
        let options = TriggerOptions {
            force,
            priority: None,
        };
        Some(coordinator.trigger_sync(trigger, options).await?)
    };
    let status = coordinator.status();
    coordinator.cleanup().await?;

    if as_json {
        let payload = serde_json::json!({ "report": report, "status": status });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    match &report {
        Some(report) => println!("{}", format_report(report)),
        None => println!("Startup sync finished"),
    }
    println!(
        "Pending local changes: {}, pending remote changes: {}",
        status.pending_local_changes, status.pending_remote_changes
    );
    Ok(())
}

pub fn format_report(report: &SyncReport) -> String {
    let mut line = format!(
        "{} sync {}: {} pushed, {} conflicts resolved, {} queued, {} pulled",
        report.trigger,
        report.outcome,
        report.pushed,
        report.conflicts_resolved,
        report.queued,
        report.pulled
    );
    if report.seeded > 0 {
        line.push_str(&format!(", {} seeded", report.seeded));
    }
    if report.queue.processed > 0 {
        line.push_str(&format!(
            " (queue: {} succeeded, {} retried, {} abandoned)",
            report.queue.succeeded, report.queue.retried, report.queue.abandoned
        ));
    }
    if matches!(report.outcome, SyncOutcome::Deferred | SyncOutcome::Failed | SyncOutcome::Busy) {
        if let Some(message) = &report.message {
            line.push_str(&format!(" - {message}"));
        }
    }
    line
}
