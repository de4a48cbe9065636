use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] satchel_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Seed file not found: {0}")]
    SeedFileNotFound(String),
    #[error(
        "Sync is not configured. Set SATCHEL_REMOTE_URL and SATCHEL_AUTH_TOKEN, or add `remote.url` to the config file."
    )]
    SyncNotConfigured,
}
