//! In-process remote store for tests and dry runs

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ReferenceData, RemoteDiagnostics, RemoteStore};
use crate::error::Error;
use crate::models::{snapshot_id, snapshot_updated_at, EntityKind, Snapshot};
use crate::Result;

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<EntityKind, BTreeMap<String, Snapshot>>,
    unreachable: bool,
    failing_writes: u32,
    write_log: Vec<(EntityKind, String)>,
}

/// In-memory remote store.
///
/// Supports a reachability toggle and failure injection for writes.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryRemoteStore {
    /// Create an empty, reachable store
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle reachability; an unreachable store fails every call
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.write().await.unreachable = !reachable;
    }

    /// Fail the next `count` writes with a retryable error
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.write().await.failing_writes = count;
    }

    /// Place a record directly into the store
    pub async fn insert(&self, entity: EntityKind, snapshot: Snapshot) {
        if let Some(id) = snapshot_id(&snapshot).map(str::to_string) {
            self.state
                .write()
                .await
                .tables
                .entry(entity)
                .or_default()
                .insert(id, entity.normalize(&snapshot));
        }
    }

    /// Read a record without going through the trait
    pub async fn get(&self, entity: EntityKind, id: &str) -> Option<Snapshot> {
        self.state
            .read()
            .await
            .tables
            .get(&entity)
            .and_then(|table| table.get(id))
            .cloned()
    }

    /// Number of records in a table
    pub async fn len(&self, entity: EntityKind) -> usize {
        self.state
            .read()
            .await
            .tables
            .get(&entity)
            .map_or(0, BTreeMap::len)
    }

    /// Successful writes in the order they were applied
    pub async fn write_log(&self) -> Vec<(EntityKind, String)> {
        self.state.read().await.write_log.clone()
    }

    async fn ensure_reachable(&self) -> Result<()> {
        if self.state.read().await.unreachable {
            Err(Error::remote_transient("remote store unreachable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn is_reachable_now(&self) -> bool {
        !self.state.read().await.unreachable
    }

    async fn sync_one_record(&self, entity: EntityKind, snapshot: &Snapshot) -> Result<()> {
        let mut state = self.state.write().await;
        if state.unreachable {
            return Err(Error::remote_transient("remote store unreachable"));
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(Error::remote_transient("injected write failure"));
        }

        let id = snapshot_id(snapshot)
            .ok_or_else(|| Error::remote_fatal(format!("{entity} record without an id")))?
            .to_string();
        state
            .tables
            .entry(entity)
            .or_default()
            .insert(id.clone(), entity.normalize(snapshot));
        state.write_log.push((entity, id));
        Ok(())
    }

    async fn fetch_record(&self, entity: EntityKind, id: &str) -> Result<Option<Snapshot>> {
        self.ensure_reachable().await?;
        Ok(self.get(entity, id).await)
    }

    async fn pull_all_reference_data(&self) -> Result<ReferenceData> {
        self.ensure_reachable().await?;
        let state = self.state.read().await;
        let rows = |entity: EntityKind| -> Vec<Snapshot> {
            state
                .tables
                .get(&entity)
                .map(|table| table.values().cloned().collect())
                .unwrap_or_default()
        };
        Ok(ReferenceData {
            quizzes: rows(EntityKind::Quiz),
            questions: rows(EntityKind::Question),
        })
    }

    async fn count_changes_since(&self, since_ms: Option<i64>) -> Result<u64> {
        self.ensure_reachable().await?;
        let state = self.state.read().await;
        let count = EntityKind::REFERENCE
            .iter()
            .filter_map(|entity| state.tables.get(entity))
            .flat_map(BTreeMap::values)
            .filter(|row| match (since_ms, snapshot_updated_at(row)) {
                (None, _) => true,
                (Some(since), Some(updated_at)) => updated_at > since,
                (Some(_), None) => false,
            })
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn connection_diagnostics(&self) -> RemoteDiagnostics {
        let reachable = self.is_reachable_now().await;
        RemoteDiagnostics {
            backend: self.name().to_string(),
            endpoint: None,
            reachable,
            latency_ms: reachable.then_some(0),
            error: (!reachable).then(|| "remote store unreachable".to_string()),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
