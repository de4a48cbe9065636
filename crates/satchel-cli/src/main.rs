//! Satchel CLI - inspect and drive offline-first sync from the terminal

mod cli;
mod commands;
mod error;


use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::common::{load_config, resolve_config_path, resolve_db_path};
use crate::commands::completions::run_completions;
use crate::commands::log::run_log;
use crate::commands::probe::run_probe;
use crate::commands::queue::run_queue;
use crate::commands::seed::run_seed;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::error::CliError;

const DEFAULT_LOG_FILTER: &str = "satchel=info";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let config_path = resolve_config_path(cli.config);

    match cli.command {
        Commands::Status { json } => {
            let config = load_config(&config_path)?;
            run_status(json, &config, &db_path).await?;
        }
        Commands::Sync {
            trigger,
            force,
            seed,
            json,
        } => {
            let config = load_config(&config_path)?;
            run_sync(
                trigger.into(),
                force,
                seed.as_deref(),
                json,
                &config,
                &db_path,
            )
            .await?;
        }
        Commands::Queue { command } => {
            let config = load_config(&config_path)?;
            run_queue(command, &config, &db_path).await?;
        }
        Commands::Log { limit, json } => run_log(limit, json, &db_path).await?,
        Commands::Probe { quality, json } => {
            let config = load_config(&config_path)?;
            run_probe(quality, json, &config).await?;
        }
        Commands::Seed { path } => run_seed(&path, &db_path).await?,
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref())?,
    }

    Ok(())
}
