use std::path::Path;

use crate::commands::common::{format_log_lines, open_store};
use crate::error::CliError;

pub async fn run_log(limit: usize, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let entries = store.recent_log(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No sync activity recorded.");
        return Ok(());
    }

    for line in format_log_lines(&entries) {
        println!("{line}");
    }
    Ok(())
}
