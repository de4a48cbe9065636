use std::path::Path;

use satchel_core::seed::{FallbackSeeder, JsonSeedProvider};

use crate::commands::common::open_store;
use crate::error::CliError;

pub async fn run_seed(seed_path: &Path, db_path: &Path) -> Result<(), CliError> {
    if !seed_path.exists() {
        return Err(CliError::SeedFileNotFound(seed_path.display().to_string()));
    }

    let store = open_store(db_path).await?;
    let outcome = JsonSeedProvider::from_path(store, seed_path)
        .perform_fallback_population()
        .await?;
    println!("Seeded {} reference rows", outcome.records_created);
    Ok(())
}
