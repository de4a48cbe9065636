//! Authoritative remote store interface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{EntityKind, Snapshot};
use crate::Result;

pub mod libsql_store;
pub mod memory;

pub use libsql_store::LibSqlRemoteStore;
pub use memory::MemoryRemoteStore;

/// Reference tables as pulled from the remote store or read from a seed file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceData {
    /// Quiz rows
    pub quizzes: Vec<Snapshot>,
    /// Question rows
    pub questions: Vec<Snapshot>,
}

impl ReferenceData {
    /// Rows of one reference table
    pub fn records(&self, entity: EntityKind) -> &[Snapshot] {
        match entity {
            EntityKind::Quiz => &self.quizzes,
            EntityKind::Question => &self.questions,
            EntityKind::Attempt | EntityKind::Learner => &[],
        }
    }

    /// Every row with its table, quizzes first
    pub fn iter(&self) -> impl Iterator<Item = (EntityKind, &Snapshot)> {
        EntityKind::REFERENCE
            .into_iter()
            .flat_map(move |entity| self.records(entity).iter().map(move |row| (entity, row)))
    }

    /// Total number of rows
    pub fn len(&self) -> usize {
        self.quizzes.len() + self.questions.len()
    }

    /// Whether no rows were returned
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connection health details for diagnostics output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDiagnostics {
    /// Backend name
    pub backend: String,
    /// Endpoint, if any
    pub endpoint: Option<String>,
    /// Whether a round trip succeeded
    pub reachable: bool,
    /// Round-trip time of the health query
    pub latency_ms: Option<u64>,
    /// Failure text when unreachable
    pub error: Option<String>,
}

/// The networked store that aggregates data across clients.
///
/// Writes are idempotent upserts of complete snapshots so replaying an
/// operation never duplicates data.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Cheap round trip used by the connectivity prober
    async fn is_reachable_now(&self) -> bool;

    /// Upsert one complete snapshot
    async fn sync_one_record(&self, entity: EntityKind, snapshot: &Snapshot) -> Result<()>;

    /// Fetch the remote copy of a record
    async fn fetch_record(&self, entity: EntityKind, id: &str) -> Result<Option<Snapshot>>;

    /// Read every reference table
    async fn pull_all_reference_data(&self) -> Result<ReferenceData>;

    /// Number of remote reference changes since `since_ms`
    async fn count_changes_since(&self, _since_ms: Option<i64>) -> Result<u64> {
        Ok(0)
    }

    /// Health details for status output
    async fn connection_diagnostics(&self) -> RemoteDiagnostics;

    /// Backend name
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reference_data_iterates_quizzes_first() {
        let data: ReferenceData = serde_json::from_value(json!({
            "questions": [{"id": "qq1"}],
            "quizzes": [{"id": "q1"}],
        }))
        .unwrap();

        let order: Vec<_> = data.iter().map(|(entity, _)| entity).collect();
        assert_eq!(order, vec![EntityKind::Quiz, EntityKind::Question]);
        assert_eq!(data.len(), 2);
        assert!(ReferenceData::default().is_empty());
    }
}
