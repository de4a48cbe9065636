use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use satchel_core::SyncTrigger;

#[derive(Parser)]
#[command(name = "satchel")]
#[command(about = "Offline-first sync between a local store and a remote store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the JSON config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show pending changes, queue depth and last sync
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a sync strategy against the remote store
    Sync {
        /// Trigger whose strategy runs after startup
        #[arg(long, value_enum, default_value_t = TriggerArg::FullSync)]
        trigger: TriggerArg,
        /// Wait for an in-flight sync instead of reporting busy
        #[arg(long)]
        force: bool,
        /// Reference data file used when the remote store is unreachable
        #[arg(long, value_name = "PATH")]
        seed: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or drive the retry queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Show recent sync log entries
    Log {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check connectivity to the remote store
    Probe {
        /// Also run a timed connection quality test
        #[arg(long)]
        quality: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Populate reference tables from a JSON file
    Seed {
        /// File shaped `{ "quizzes": [...], "questions": [...] }`
        path: PathBuf,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List queued operations, oldest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop every queued operation
    Clear,
    /// Replay eligible operations against the remote store
    Process {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum TriggerArg {
    Startup,
    RecordFinalized,
    RecordProgress,
    NetworkReconnection,
    Periodic,
    FullSync,
    Shutdown,
}

impl From<TriggerArg> for SyncTrigger {
    fn from(value: TriggerArg) -> Self {
        match value {
            TriggerArg::Startup => Self::Startup,
            TriggerArg::RecordFinalized => Self::RecordFinalized,
            TriggerArg::RecordProgress => Self::RecordProgress,
            TriggerArg::NetworkReconnection => Self::NetworkReconnection,
            TriggerArg::Periodic => Self::Periodic,
            TriggerArg::FullSync => Self::FullSync,
            TriggerArg::Shutdown => Self::Shutdown,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
