//! Durable, tiered retry queue for sync operations.
//!
//! Operations live in three in-memory lists (one per [`Tier`]) mirrored into
//! the `sync_queue` table. Every mutation reaches durable storage before the
//! in-memory list changes, so a crash never loses an acknowledged operation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use super::conflict::ConflictResolver;
use crate::config::{TierPolicy, TierTable};
use crate::db::LocalStore;
use crate::error::Error;
use crate::models::{
    snapshot_updated_at, OperationId, OperationKind, QueuedOperation, SyncLogEntry, SyncLogStatus,
    SyncOperation, Tier,
};
use crate::remote::RemoteStore;
use crate::util::now_ms;
use crate::Result;

/// Counts from one `process_queue` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    /// Operations attempted
    pub processed: usize,
    /// Operations that completed and left the queue
    pub succeeded: usize,
    /// Operations rescheduled with backoff
    pub retried: usize,
    /// Operations dropped after exhausting retries or failing permanently
    pub abandoned: usize,
    /// Succeeded operations that went through conflict resolution
    pub conflicts_resolved: usize,
}

impl QueueSummary {
    fn absorb(&mut self, other: Self) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.abandoned += other.abandoned;
        self.conflicts_resolved += other.conflicts_resolved;
    }
}

type TierLists = [Vec<QueuedOperation>; 3];

struct QueueInner {
    store: LocalStore,
    tiers: TierTable,
    lists: Mutex<TierLists>,
    processing: Mutex<()>,
    initialized: AtomicBool,
}

/// At-least-once work queue with per-tier batching and backoff.
#[derive(Clone)]
pub struct RetryQueue {
    inner: Arc<QueueInner>,
}

impl RetryQueue {
    /// Create an uninitialized queue over the local store
    pub fn new(store: LocalStore, tiers: TierTable) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                tiers,
                lists: Mutex::new(TierLists::default()),
                processing: Mutex::new(()),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Prepare durable storage and load operations that are due now.
    ///
    /// Returns the number of operations loaded into memory.
    pub async fn initialize(&self) -> Result<usize> {
        self.inner.store.ensure_queue_table().await?;
        self.inner.initialized.store(true, Ordering::SeqCst);
        let loaded = self.reload_due(now_ms()).await?;
        tracing::info!("Retry queue ready with {loaded} due operations");
        Ok(loaded)
    }

    /// Whether `initialize` has completed
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self, operation: &'static str) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            tracing::error!("Retry queue {operation} called before initialize()");
            Err(Error::NotInitialized(operation))
        }
    }

    /// Tier policy (batch size, retry budget, backoff)
    pub fn policy(&self, tier: Tier) -> &TierPolicy {
        self.inner.tiers.policy(tier)
    }

    /// Delay before retry number `retry_count` of a tier
    pub fn backoff_delay(&self, tier: Tier, retry_count: u32) -> Duration {
        self.policy(tier).backoff_delay(retry_count)
    }

    /// Persist an operation, then append it to its tier.
    pub async fn add_operation(
        &self,
        operation: SyncOperation,
        tier: Tier,
    ) -> Result<QueuedOperation> {
        self.ensure_initialized("add_operation")?;
        let queued = QueuedOperation::new(operation, tier);

        let mut lists = self.inner.lists.lock().await;
        self.inner.store.save_queued(&queued).await?;
        lists[tier.index()].push(queued.clone());
        drop(lists);

        tracing::debug!(
            "Queued {} of {} {} as {tier}",
            queued.operation.kind,
            queued.operation.entity,
            queued.operation.record_id
        );
        Ok(queued)
    }

    /// Persist an operation in place of any queued one for the same record.
    ///
    /// Retry bookkeeping carries over, so a record that keeps failing still
    /// runs out of retries.
    pub async fn replace_operation(
        &self,
        operation: SyncOperation,
        tier: Tier,
    ) -> Result<QueuedOperation> {
        self.ensure_initialized("replace_operation")?;

        let mut lists = self.inner.lists.lock().await;
        let superseded: Vec<QueuedOperation> = self
            .inner
            .store
            .list_queued()
            .await?
            .into_iter()
            .filter(|queued| same_target(&queued.operation, &operation))
            .collect();

        let mut queued = QueuedOperation::new(operation, tier);
        if let Some(previous) = superseded.iter().max_by_key(|item| item.retry_count) {
            queued.retry_count = previous.retry_count;
            queued.next_retry_at = previous.next_retry_at;
            queued.last_error.clone_from(&previous.last_error);
        }

        self.inner.store.save_queued(&queued).await?;
        for previous in &superseded {
            self.inner
                .store
                .delete_queued(&previous.operation.id.as_str())
                .await?;
        }
        for list in lists.iter_mut() {
            list.retain(|item| !same_target(&item.operation, &queued.operation));
        }
        lists[tier.index()].push(queued.clone());
        drop(lists);

        if !superseded.is_empty() {
            tracing::debug!(
                "Replaced {} queued operations for {} {}",
                superseded.len(),
                queued.operation.entity,
                queued.operation.record_id
            );
        }
        Ok(queued)
    }

    /// Pull durable rows that became due into memory.
    async fn reload_due(&self, now: i64) -> Result<usize> {
        let due = self.inner.store.list_due_queued(now).await?;
        let mut lists = self.inner.lists.lock().await;
        let known: HashSet<OperationId> = lists
            .iter()
            .flatten()
            .map(|queued| queued.operation.id)
            .collect();

        let mut loaded = 0;
        for queued in due {
            if !known.contains(&queued.operation.id) {
                lists[queued.tier.index()].push(queued);
                loaded += 1;
            }
        }
        for list in lists.iter_mut() {
            list.sort_by_key(|queued| queued.operation.created_at);
        }
        Ok(loaded)
    }

    /// Replay eligible operations, highest tier first.
    ///
    /// Writes go through `resolver` whenever the remote copy diverges.
    /// Returns an empty summary when another pass is already running.
    pub async fn process_queue(
        &self,
        remote: &dyn RemoteStore,
        local: &LocalStore,
        resolver: &ConflictResolver,
    ) -> Result<QueueSummary> {
        self.ensure_initialized("process_queue")?;
        let Ok(_guard) = self.inner.processing.try_lock() else {
            tracing::debug!("Retry queue pass already running");
            return Ok(QueueSummary::default());
        };

        self.reload_due(now_ms()).await?;

        let mut summary = QueueSummary::default();
        let mut attempted = HashSet::new();
        for tier in Tier::ALL {
            let tier_summary = self
                .drain_tier(tier, remote, local, resolver, &mut attempted)
                .await?;
            if tier_summary.processed > 0 {
                tracing::info!(
                    "Retry queue {tier}: {} succeeded, {} retried, {} abandoned",
                    tier_summary.succeeded,
                    tier_summary.retried,
                    tier_summary.abandoned
                );
            }
            summary.absorb(tier_summary);
        }
        Ok(summary)
    }

    async fn drain_tier(
        &self,
        tier: Tier,
        remote: &dyn RemoteStore,
        local: &LocalStore,
        resolver: &ConflictResolver,
        attempted: &mut HashSet<OperationId>,
    ) -> Result<QueueSummary> {
        let policy = self.policy(tier).clone();
        let mut summary = QueueSummary::default();

        loop {
            let batch: Vec<QueuedOperation> = {
                let lists = self.inner.lists.lock().await;
                let now = now_ms();
                lists[tier.index()]
                    .iter()
                    .filter(|queued| {
                        queued.is_eligible(now) && !attempted.contains(&queued.operation.id)
                    })
                    .take(policy.batch_size.max(1))
                    .cloned()
                    .collect()
            };
            if batch.is_empty() {
                break;
            }

            for queued in batch {
                attempted.insert(queued.operation.id);
                summary.processed += 1;
                match execute(&queued.operation, remote, local, resolver).await {
                    Ok(resolved) => {
                        self.complete(&queued).await?;
                        summary.succeeded += 1;
                        if resolved {
                            summary.conflicts_resolved += 1;
                        }
                    }
                    Err(error) => {
                        if self.fail(&queued, &error, &policy).await? {
                            summary.abandoned += 1;
                        } else {
                            summary.retried += 1;
                        }
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Delete the durable row, then drop the operation from memory.
    async fn complete(&self, queued: &QueuedOperation) -> Result<()> {
        let id = queued.operation.id;
        let mut lists = self.inner.lists.lock().await;
        self.inner.store.delete_queued(&id.as_str()).await?;
        lists[queued.tier.index()].retain(|item| item.operation.id != id);
        Ok(())
    }

    /// Record a failed attempt. Returns true when the operation was abandoned.
    async fn fail(
        &self,
        queued: &QueuedOperation,
        error: &Error,
        policy: &TierPolicy,
    ) -> Result<bool> {
        let next = queued.with_failure(error.to_string(), policy, now_ms());
        let id = queued.operation.id;

        if error.is_retryable() && !next.is_exhausted(policy) {
            let mut lists = self.inner.lists.lock().await;
            self.inner.store.save_queued(&next).await?;
            if let Some(slot) = lists[queued.tier.index()]
                .iter_mut()
                .find(|item| item.operation.id == id)
            {
                *slot = next.clone();
            }
            drop(lists);

            tracing::debug!(
                "Retry {} for {} {} scheduled at {:?}: {error}",
                next.retry_count,
                next.operation.entity,
                next.operation.record_id,
                next.next_retry_at
            );
            return Ok(false);
        }

        let mut lists = self.inner.lists.lock().await;
        self.inner.store.delete_queued(&id.as_str()).await?;
        lists[queued.tier.index()].retain(|item| item.operation.id != id);
        drop(lists);

        let reason = if error.is_retryable() {
            format!("permanent: retries exhausted after {} attempts", next.retry_count)
        } else {
            "permanent: non-retryable error".to_string()
        };
        tracing::warn!(
            "Abandoning {} of {} {} ({reason}): {error}",
            queued.operation.kind,
            queued.operation.entity,
            queued.operation.record_id
        );
        let entry = SyncLogEntry::new(
            queued.operation.kind.as_str(),
            queued.operation.entity.table_name(),
            queued.operation.record_id.as_str(),
            SyncLogStatus::Failed,
        )
        .with_error(error.to_string())
        .with_details(reason);
        self.inner.store.append_log(&entry).await?;
        Ok(true)
    }

    /// Number of operations held in memory, optionally for one tier
    pub async fn pending_count(&self, tier: Option<Tier>) -> usize {
        let lists = self.inner.lists.lock().await;
        match tier {
            Some(tier) => lists[tier.index()].len(),
            None => lists.iter().map(Vec::len).sum(),
        }
    }

    /// Operations held in memory, oldest first
    pub async fn pending_operations(&self) -> Vec<QueuedOperation> {
        let lists = self.inner.lists.lock().await;
        let mut operations: Vec<_> = lists.iter().flatten().cloned().collect();
        operations.sort_by_key(|queued| queued.operation.created_at);
        operations
    }

    /// Drop every operation from memory and durable storage
    pub async fn clear_queue(&self) -> Result<u64> {
        let mut lists = self.inner.lists.lock().await;
        let removed = self.inner.store.clear_queued().await?;
        for list in lists.iter_mut() {
            list.clear();
        }
        tracing::info!("Cleared {removed} queued operations");
        Ok(removed)
    }

    /// Flush memory to durable storage and release the in-memory lists
    pub async fn cleanup(&self) -> Result<()> {
        if !self.is_initialized() {
            return Ok(());
        }
        let mut lists = self.inner.lists.lock().await;
        for queued in lists.iter().flatten() {
            self.inner.store.save_queued(queued).await?;
        }
        for list in lists.iter_mut() {
            list.clear();
        }
        self.inner.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Both operations move the same record in the same direction.
fn same_target(left: &SyncOperation, right: &SyncOperation) -> bool {
    left.entity == right.entity
        && left.record_id == right.record_id
        && (left.kind == OperationKind::Pull) == (right.kind == OperationKind::Pull)
}

/// Perform one operation against the stores.
///
/// Returns true when a write was settled by conflict resolution.
async fn execute(
    operation: &SyncOperation,
    remote: &dyn RemoteStore,
    local: &LocalStore,
    resolver: &ConflictResolver,
) -> Result<bool> {
    let entity = operation.entity;
    match operation.kind {
        OperationKind::Push | OperationKind::ConflictResolution => {
            // A newer local edit supersedes the queued snapshot
            let mut payload = operation.payload.clone();
            if operation.kind == OperationKind::Push {
                if let Some(current) = local.get_record(entity, &operation.record_id).await? {
                    if snapshot_updated_at(&current) > snapshot_updated_at(&payload) {
                        payload = current;
                    }
                }
            }

            let remote_copy = remote.fetch_record(entity, &operation.record_id).await?;
            if let Some(conflict) =
                resolver.detect_conflict(entity, Some(&payload), remote_copy.as_ref())
            {
                let resolution = resolver.plan(&conflict);
                resolver.apply(&conflict, &resolution, remote, local).await?;
                return Ok(true);
            }

            remote.sync_one_record(entity, &payload).await?;
            local
                .mark_synced(entity, &operation.record_id, snapshot_updated_at(&payload))
                .await?;
        }
        OperationKind::Pull => {
            if let Some(snapshot) = remote.fetch_record(entity, &operation.record_id).await? {
                local.upsert_record(entity, &snapshot, true).await?;
            }
        }
    }
    Ok(false)
}
