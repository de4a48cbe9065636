//! Fallback population of reference data when the remote store is unreachable.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::db::{LocalStore, Statement};
use crate::models::snapshot_id;
use crate::remote::ReferenceData;
use crate::Result;

/// Result of a fallback population run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedOutcome {
    /// Rows written to the local store
    pub records_created: u64,
}

/// Provider of bundled reference data for an empty local store
#[async_trait]
pub trait FallbackSeeder: Send + Sync {
    /// Populate the local reference tables
    async fn perform_fallback_population(&self) -> Result<SeedOutcome>;
}

#[derive(Debug, Clone)]
enum SeedSource {
    File(PathBuf),
    Inline(ReferenceData),
}

/// Seeds reference tables from a JSON document shaped
/// `{ "quizzes": [...], "questions": [...] }`.
#[derive(Clone)]
pub struct JsonSeedProvider {
    store: LocalStore,
    source: SeedSource,
}

impl JsonSeedProvider {
    /// Read the document from a file on each run
    pub fn from_path(store: LocalStore, path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            source: SeedSource::File(path.into()),
        }
    }

    /// Parse the document once up front
    pub fn from_json(store: LocalStore, payload: &str) -> Result<Self> {
        Ok(Self {
            store,
            source: SeedSource::Inline(serde_json::from_str(payload)?),
        })
    }

    async fn load(&self) -> Result<ReferenceData> {
        match &self.source {
            SeedSource::File(path) => {
                let payload = tokio::fs::read_to_string(path).await?;
                Ok(serde_json::from_str(&payload)?)
            }
            SeedSource::Inline(data) => Ok(data.clone()),
        }
    }
}

/// Write reference rows to the local store in one transaction.
///
/// Rows without an id are skipped with a warning.
pub async fn write_reference_data(store: &LocalStore, data: &ReferenceData) -> Result<u64> {
    let mut statements = Vec::with_capacity(data.len());
    for (entity, row) in data.iter() {
        if snapshot_id(row).is_none() {
            tracing::warn!("Skipping {entity} reference row without an id");
            continue;
        }
        statements.push(Statement::upsert(entity, row, true)?);
    }

    let written = u64::try_from(statements.len()).unwrap_or(u64::MAX);
    if written > 0 {
        store.run_in_transaction(statements).await?;
    }
    Ok(written)
}

#[async_trait]
impl FallbackSeeder for JsonSeedProvider {
    async fn perform_fallback_population(&self) -> Result<SeedOutcome> {
        let data = self.load().await?;
        let records_created = write_reference_data(&self.store, &data).await?;
        tracing::info!("Fallback population wrote {records_created} reference rows");
        Ok(SeedOutcome { records_created })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;
    use tempfile::tempdir;

    const SEED: &str = r#"{
        "quizzes": [{"id": "q1", "title": "Minerals", "question_count": 2, "updated_at": 1}],
        "questions": [
            {"id": "qq1", "quiz_id": "q1", "prompt": "Hardest?", "choices": ["talc", "diamond"], "correct_choice": 1, "position": 0},
            {"id": "qq2", "quiz_id": "q1", "prompt": "Softest?", "choices": ["talc", "diamond"], "correct_choice": 0, "position": 1},
            {"prompt": "orphan without id"}
        ]
    }"#;

    #[tokio::test(flavor = "multi_thread")]
    async fn inline_seed_populates_reference_tables() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let seeder = JsonSeedProvider::from_json(store.clone(), SEED).unwrap();

        let outcome = seeder.perform_fallback_population().await.unwrap();
        assert_eq!(outcome.records_created, 3);
        assert_eq!(store.count_records(EntityKind::Quiz).await.unwrap(), 1);
        assert_eq!(store.count_records(EntityKind::Question).await.unwrap(), 2);
        assert!(!store.reference_data_is_empty().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_seed_is_idempotent() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("seed.json");
        std::fs::write(&path, SEED).unwrap();

        let store = LocalStore::open_in_memory().await.unwrap();
        let seeder = JsonSeedProvider::from_path(store.clone(), &path);
        seeder.perform_fallback_population().await.unwrap();
        seeder.perform_fallback_population().await.unwrap();

        assert_eq!(store.count_records(EntityKind::Question).await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_file_is_an_error() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let seeder = JsonSeedProvider::from_path(store, "/nonexistent/seed.json");
        assert!(matches!(
            seeder.perform_fallback_population().await,
            Err(crate::Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn file_seed_runs_on_current_thread_runtime() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("seed.json");
        tokio::fs::write(&path, SEED).await.unwrap();

        let store = LocalStore::open_in_memory().await.unwrap();
        let seeder = JsonSeedProvider::from_path(store.clone(), &path);
        let outcome = seeder.perform_fallback_population().await.unwrap();
        assert_eq!(outcome.records_created, 3);
    }
}
