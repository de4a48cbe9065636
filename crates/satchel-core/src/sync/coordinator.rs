//! Sync coordinator: owns the queue, resolver and prober and runs one sync
//! strategy at a time.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::connectivity::{ConnectivityCallback, ConnectivityProber, NetworkInfo, SubscriptionId};
use super::queue::RetryQueue;
use super::trigger::{SyncOutcome, SyncReport, SyncTrigger, TriggerOptions};
use super::ConflictResolver;
use crate::config::{ProberSettings, SatchelConfig, SyncSettings};
use crate::db::{LocalStore, LAST_FULL_SYNC_KEY, LAST_SYNC_KEY};
use crate::error::Error;
use crate::models::{
    snapshot_id, snapshot_updated_at, ConnectivityStatus, EntityKind, OperationKind,
    QueuedOperation, Snapshot, SyncLogEntry, SyncLogStatus, SyncOperation, SyncStatus,
};
use crate::remote::RemoteStore;
use crate::seed::{write_reference_data, FallbackSeeder};
use crate::util::now_ms;
use crate::Result;

/// Which unsynced rows a strategy pushes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushScope {
    /// Final attempts
    Critical,
    /// In-progress attempts
    Important,
    /// Every pushable entity
    All,
}

impl PushScope {
    const fn selections(self) -> &'static [(EntityKind, Option<bool>)] {
        match self {
            Self::Critical => &[(EntityKind::Attempt, Some(true))],
            Self::Important => &[(EntityKind::Attempt, Some(false))],
            Self::All => &[(EntityKind::Attempt, None), (EntityKind::Learner, None)],
        }
    }
}

#[derive(Clone)]
struct Active {
    remote: Option<Arc<dyn RemoteStore>>,
    prober: ConnectivityProber,
    subscription: SubscriptionId,
}

struct CoordinatorInner {
    local: LocalStore,
    settings: SyncSettings,
    prober_settings: ProberSettings,
    seeder: Option<Arc<dyn FallbackSeeder>>,
    queue: RetryQueue,
    resolver: ConflictResolver,
    init_lock: Mutex<()>,
    run_lock: Mutex<()>,
    status: watch::Sender<SyncStatus>,
    active: RwLock<Option<Active>>,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`SyncCoordinator`]
pub struct SyncCoordinatorBuilder {
    local: LocalStore,
    config: SatchelConfig,
    seeder: Option<Arc<dyn FallbackSeeder>>,
}

impl SyncCoordinatorBuilder {
    /// Seeder used when reference data is missing and the remote is unreachable
    #[must_use]
    pub fn seeder(mut self, seeder: Arc<dyn FallbackSeeder>) -> Self {
        self.seeder = Some(seeder);
        self
    }

    /// Build an uninitialized coordinator
    pub fn build(self) -> SyncCoordinator {
        let queue = RetryQueue::new(self.local.clone(), self.config.sync.tiers.clone());
        let resolver = ConflictResolver::from_settings(&self.config.sync);
        let (status, _) = watch::channel(SyncStatus::default());

        SyncCoordinator {
            inner: Arc::new(CoordinatorInner {
                local: self.local,
                settings: self.config.sync,
                prober_settings: self.config.prober,
                seeder: self.seeder,
                queue,
                resolver,
                init_lock: Mutex::new(()),
                run_lock: Mutex::new(()),
                status,
                active: RwLock::new(None),
                periodic: Mutex::new(None),
            }),
        }
    }
}

/// Entry point of the sync subsystem.
///
/// Cheap to clone; every clone drives the same queue, prober and status.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    /// Start building a coordinator over a local store
    pub fn builder(local: LocalStore, config: SatchelConfig) -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder {
            local,
            config,
            seeder: None,
        }
    }

    /// Coordinator without a fallback seeder
    pub fn new(local: LocalStore, config: &SatchelConfig) -> Self {
        Self::builder(local, config.clone()).build()
    }

    /// Wire the queue and prober, then run the startup sync.
    ///
    /// Calling this again after success is a no-op. Without a remote store
    /// every trigger is deferred.
    pub async fn initialize(&self, remote: Option<Arc<dyn RemoteStore>>) -> Result<()> {
        {
            let _init = self.inner.init_lock.lock().await;
            if self.inner.active.read().await.is_some() {
                tracing::debug!("Sync coordinator already initialized");
                return Ok(());
            }

            self.inner.queue.initialize().await?;

            let last_sync_at = self
                .inner
                .local
                .get_metadata(LAST_SYNC_KEY)
                .await
                .unwrap_or_else(|error| {
                    tracing::warn!("Failed to load last sync time: {error}");
                    None
                })
                .and_then(|value| value.parse::<i64>().ok());
            self.inner
                .status
                .send_modify(|status| status.last_sync_at = last_sync_at);

            let prober = ConnectivityProber::new(self.inner.prober_settings.clone(), remote.clone());
            prober.initialize();
            prober
                .start_monitoring(self.inner.prober_settings.monitor_interval())
                .await;
            let subscription = prober
                .on_connectivity_change(connectivity_callback(Arc::downgrade(&self.inner)))
                .await;

            *self.inner.active.write().await = Some(Active {
                remote: remote.clone(),
                prober: prober.clone(),
                subscription,
            });

            let online = remote.is_some() && prober.check_connectivity().await;
            self.set_online(online);
            if online {
                self.start_periodic().await;
            }
            self.refresh_status(remote.as_deref()).await;
            tracing::info!(
                "Sync coordinator initialized ({})",
                if online { "online" } else { "offline" }
            );
        }

        let report = self
            .trigger_sync(SyncTrigger::Startup, TriggerOptions::default())
            .await?;
        tracing::info!("Startup sync {}", report.outcome);
        Ok(())
    }

    async fn active(&self, operation: &'static str) -> Result<Active> {
        self.inner.active.read().await.clone().ok_or_else(|| {
            tracing::error!("Sync coordinator {operation} called before initialize()");
            Error::NotInitialized(operation)
        })
    }

    /// Whether `initialize` has completed
    pub async fn is_initialized(&self) -> bool {
        self.inner.active.read().await.is_some()
    }

    /// Run the strategy for a trigger.
    ///
    /// Remote failures never surface here: affected records are queued and
    /// the report says how the run ended.
    pub async fn trigger_sync(
        &self,
        trigger: SyncTrigger,
        options: TriggerOptions,
    ) -> Result<SyncReport> {
        let active = self.active("trigger_sync").await?;

        let _run = if options.force {
            self.inner.run_lock.lock().await
        } else if let Ok(guard) = self.inner.run_lock.try_lock() {
            guard
        } else {
            tracing::debug!("Skipping {trigger} sync: another sync is in progress");
            return Ok(SyncReport::new(trigger)
                .finish(SyncOutcome::Busy, Some("another sync is in progress".to_string())));
        };

        let mut report = SyncReport::new(trigger);
        let online = match &active.remote {
            Some(_) => active.prober.check_connectivity().await,
            None => false,
        };
        self.set_online(online);
        let Some(remote) = active.remote.clone().filter(|_| online) else {
            return Ok(self.run_offline(report).await);
        };

        self.inner
            .status
            .send_modify(|status| status.sync_in_progress = true);
        tracing::debug!("Running {trigger} sync");

        let result = self
            .run_strategy(trigger, remote.as_ref(), options, &mut report)
            .await;
        let report = match result {
            Ok(()) => report.finish(SyncOutcome::Completed, None),
            Err(error) => {
                tracing::warn!("{trigger} sync failed: {error}");
                report.finish(SyncOutcome::Failed, Some(error.to_string()))
            }
        };

        if report.outcome == SyncOutcome::Completed {
            self.record_last_sync(report.finished_at).await;
        }
        self.inner
            .status
            .send_modify(|status| status.sync_in_progress = false);
        self.refresh_status(Some(remote.as_ref())).await;

        tracing::info!(
            "{trigger} sync {}: {} pushed, {} conflicts, {} queued, {} pulled",
            report.outcome,
            report.pushed,
            report.conflicts_resolved,
            report.queued,
            report.pulled
        );
        Ok(report)
    }

    async fn run_offline(&self, mut report: SyncReport) -> SyncReport {
        match self.seed_if_empty().await {
            Ok(seeded) => report.seeded = seeded,
            Err(error) => tracing::warn!("Fallback population failed: {error}"),
        }
        self.refresh_status(None).await;

        let pending = self.inner.queue.pending_count(None).await;
        tracing::debug!("Offline: {} sync deferred", report.trigger);
        report.finish(
            SyncOutcome::Deferred,
            Some(format!("offline; {pending} queued operations stay queued")),
        )
    }

    async fn run_strategy(
        &self,
        trigger: SyncTrigger,
        remote: &dyn RemoteStore,
        options: TriggerOptions,
        report: &mut SyncReport,
    ) -> Result<()> {
        let local = &self.inner.local;
        match trigger {
            SyncTrigger::Startup => {
                self.push_scope(PushScope::Critical, remote, options, report)
                    .await?;
                self.pull_if_empty(remote, report).await?;
            }
            SyncTrigger::RecordFinalized | SyncTrigger::Shutdown => {
                local.checkpoint().await?;
                self.push_scope(PushScope::Critical, remote, options, report)
                    .await?;
            }
            SyncTrigger::RecordProgress | SyncTrigger::Periodic => {
                self.push_scope(PushScope::Important, remote, options, report)
                    .await?;
            }
            SyncTrigger::NetworkReconnection => {
                self.drain_queue(remote, report).await?;
                self.push_scope(PushScope::All, remote, options, report)
                    .await?;
                self.pull_if_empty(remote, report).await?;
            }
            SyncTrigger::FullSync => {
                self.drain_queue(remote, report).await?;
                self.push_scope(PushScope::All, remote, options, report)
                    .await?;
                report.pulled = self.pull_reference(remote).await?;
                local
                    .set_metadata(LAST_FULL_SYNC_KEY, &now_ms().to_string())
                    .await?;
            }
        }
        Ok(())
    }

    async fn drain_queue(&self, remote: &dyn RemoteStore, report: &mut SyncReport) -> Result<()> {
        let inner = &self.inner;
        report.queue = inner
            .queue
            .process_queue(remote, &inner.local, &inner.resolver)
            .await?;
        report.conflicts_resolved += report.queue.conflicts_resolved;
        Ok(())
    }

    async fn push_scope(
        &self,
        scope: PushScope,
        remote: &dyn RemoteStore,
        options: TriggerOptions,
        report: &mut SyncReport,
    ) -> Result<()> {
        for &(entity, is_final) in scope.selections() {
            let rows = self.inner.local.list_unsynced(entity, is_final).await?;
            tracing::debug!("{} unsynced {entity} rows to push", rows.len());
            for row in rows {
                self.push_record(entity, row, remote, options, report)
                    .await?;
            }
        }
        Ok(())
    }

    /// Push one record; remote failures are queued and do not end the run.
    async fn push_record(
        &self,
        entity: EntityKind,
        mut snapshot: Snapshot,
        remote: &dyn RemoteStore,
        options: TriggerOptions,
        report: &mut SyncReport,
    ) -> Result<()> {
        let local = &self.inner.local;
        let Some(id) = snapshot_id(&snapshot).map(str::to_string) else {
            tracing::warn!("Skipping {entity} row without an id");
            report.skipped += 1;
            return Ok(());
        };

        if snapshot_updated_at(&snapshot).is_none() {
            tracing::warn!("{entity} {id} has no valid updated_at; stamping the current time");
            snapshot.insert("updated_at".to_string(), now_ms().into());
            local.upsert_record(entity, &snapshot, false).await?;
        }

        let remote_copy = match remote.fetch_record(entity, &id).await {
            Ok(copy) => copy,
            Err(error) => {
                let operation = SyncOperation::push(entity, id, snapshot);
                return self.defer(operation, &error, options, report).await;
            }
        };

        let resolver = &self.inner.resolver;
        if let Some(conflict) = resolver.detect_conflict(entity, Some(&snapshot), remote_copy.as_ref())
        {
            let resolution = resolver.plan(&conflict);
            match resolver.apply(&conflict, &resolution, remote, local).await {
                Ok(()) => report.conflicts_resolved += 1,
                Err(error) => {
                    let operation = SyncOperation::new(
                        OperationKind::ConflictResolution,
                        entity,
                        id,
                        resolution.resolved,
                    );
                    self.defer(operation, &error, options, report).await?;
                }
            }
            return Ok(());
        }

        match remote.sync_one_record(entity, &snapshot).await {
            Ok(()) => {
                local
                    .mark_synced(entity, &id, snapshot_updated_at(&snapshot))
                    .await?;
                let entry = SyncLogEntry::new(
                    OperationKind::Push.as_str(),
                    entity.table_name(),
                    id.as_str(),
                    SyncLogStatus::Success,
                )
                .with_details(report.trigger.as_str());
                local.append_log(&entry).await?;
                tracing::debug!("Pushed {entity} {id}");
                report.pushed += 1;
                Ok(())
            }
            Err(error) => {
                let operation = SyncOperation::push(entity, id, snapshot);
                self.defer(operation, &error, options, report).await
            }
        }
    }

    /// Hand a failed record to the retry queue and note it in the audit log.
    async fn defer(
        &self,
        operation: SyncOperation,
        error: &Error,
        options: TriggerOptions,
        report: &mut SyncReport,
    ) -> Result<()> {
        let tier = options.priority.unwrap_or_else(|| operation.tier());
        tracing::warn!(
            "Queueing {} of {} {} as {tier}: {error}",
            operation.kind,
            operation.entity,
            operation.record_id
        );

        let entry = SyncLogEntry::new(
            operation.kind.as_str(),
            operation.entity.table_name(),
            operation.record_id.as_str(),
            SyncLogStatus::Pending,
        )
        .with_error(error.to_string())
        .with_details(report.trigger.as_str());

        self.inner.queue.replace_operation(operation, tier).await?;
        self.inner.local.append_log(&entry).await?;
        report.queued += 1;
        Ok(())
    }

    async fn pull_if_empty(&self, remote: &dyn RemoteStore, report: &mut SyncReport) -> Result<()> {
        if !self.inner.local.reference_data_is_empty().await? {
            return Ok(());
        }
        match self.pull_reference(remote).await {
            Ok(pulled) => report.pulled = pulled,
            Err(error) => {
                tracing::warn!("Reference data pull failed: {error}");
                report.seeded = self.seed_if_empty().await?;
            }
        }
        Ok(())
    }

    async fn pull_reference(&self, remote: &dyn RemoteStore) -> Result<u64> {
        let data = remote.pull_all_reference_data().await?;
        let pulled = write_reference_data(&self.inner.local, &data).await?;
        tracing::info!("Pulled {pulled} reference rows from {}", remote.name());
        Ok(pulled)
    }

    async fn seed_if_empty(&self) -> Result<u64> {
        let Some(seeder) = &self.inner.seeder else {
            return Ok(0);
        };
        if !self.inner.local.reference_data_is_empty().await? {
            return Ok(0);
        }
        let outcome = seeder.perform_fallback_population().await?;
        Ok(outcome.records_created)
    }

    async fn record_last_sync(&self, at: i64) {
        if let Err(error) = self
            .inner
            .local
            .set_metadata(LAST_SYNC_KEY, &at.to_string())
            .await
        {
            tracing::warn!("Failed to record last sync time: {error}");
            return;
        }
        self.inner
            .status
            .send_modify(|status| status.last_sync_at = Some(at));
    }

    async fn refresh_status(&self, remote: Option<&dyn RemoteStore>) {
        let pending_local = match self.inner.local.count_unsynced().await {
            Ok(count) => Some(count),
            Err(error) => {
                tracing::warn!("Failed to count unsynced rows: {error}");
                None
            }
        };
        let since = self.inner.status.borrow().last_sync_at;
        let pending_remote = match remote {
            Some(remote) => remote.count_changes_since(since).await.unwrap_or_else(|error| {
                tracing::debug!("Failed to count remote changes: {error}");
                0
            }),
            None => 0,
        };

        self.inner.status.send_modify(|status| {
            if let Some(count) = pending_local {
                status.pending_local_changes = count;
            }
            status.pending_remote_changes = pending_remote;
        });
    }

    fn set_online(&self, online: bool) {
        self.inner
            .status
            .send_if_modified(|status| {
                let changed = status.is_online != online;
                status.is_online = online;
                changed
            });
    }

    async fn start_periodic(&self) {
        let interval = self.inner.settings.periodic_interval();
        if interval.is_zero() {
            return;
        }
        let mut periodic = self.inner.periodic.lock().await;
        if periodic.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *periodic = Some(spawn_periodic(Arc::downgrade(&self.inner), interval));
        tracing::debug!("Periodic sync every {interval:?}");
    }

    async fn stop_periodic(&self) {
        if let Some(handle) = self.inner.periodic.lock().await.take() {
            handle.abort();
        }
    }

    /// Whether the periodic timer is running
    pub async fn is_periodic_running(&self) -> bool {
        self.inner
            .periodic
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Classify an operation and hand it to the retry queue
    pub async fn queue_operation(&self, operation: SyncOperation) -> Result<QueuedOperation> {
        self.active("queue_operation").await?;
        let tier = operation.tier();
        let queued = self.inner.queue.add_operation(operation, tier).await?;
        Ok(queued)
    }

    /// Snapshot of the current sync status
    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    /// Receiver notified on every status change
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Connectivity details from the prober
    pub async fn network_info(&self) -> Result<NetworkInfo> {
        let active = self.active("network_info").await?;
        Ok(active.prober.network_info().await)
    }

    /// The retry queue driven by this coordinator
    pub fn retry_queue(&self) -> &RetryQueue {
        &self.inner.queue
    }

    /// The conflict resolver used by push strategies
    pub fn resolver(&self) -> &ConflictResolver {
        &self.inner.resolver
    }

    /// Stop timers, run a bounded final sync and release the queue and prober.
    pub async fn cleanup(&self) -> Result<()> {
        let active = self.active("cleanup").await?;

        self.stop_periodic().await;
        active.prober.stop_monitoring().await;

        let online = self.inner.status.borrow().is_online;
        if active.remote.is_some() && online {
            let shutdown_timeout = self.inner.settings.shutdown_timeout();
            match timeout(
                shutdown_timeout,
                self.trigger_sync(SyncTrigger::Shutdown, TriggerOptions::forced()),
            )
            .await
            {
                Ok(Ok(report)) => tracing::info!("Shutdown sync {}", report.outcome),
                Ok(Err(error)) => tracing::warn!("Shutdown sync failed: {error}"),
                Err(_) => tracing::warn!("Shutdown sync timed out after {shutdown_timeout:?}"),
            }
        }

        active
            .prober
            .off_connectivity_change(active.subscription)
            .await;
        active.prober.cleanup().await;
        self.inner.queue.cleanup().await?;
        *self.inner.active.write().await = None;
        tracing::info!("Sync coordinator stopped");
        Ok(())
    }
}

fn connectivity_callback(inner: Weak<CoordinatorInner>) -> ConnectivityCallback {
    Arc::new(move |status: ConnectivityStatus| {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let coordinator = SyncCoordinator { inner };
        tokio::spawn(async move {
            match status {
                ConnectivityStatus::Online => {
                    coordinator.set_online(true);
                    coordinator.start_periodic().await;
                    match coordinator
                        .trigger_sync(SyncTrigger::NetworkReconnection, TriggerOptions::forced())
                        .await
                    {
                        Ok(report) => tracing::info!("Reconnection sync {}", report.outcome),
                        Err(error) => tracing::warn!("Reconnection sync failed: {error}"),
                    }
                }
                ConnectivityStatus::Offline => {
                    coordinator.set_online(false);
                    coordinator.stop_periodic().await;
                }
                ConnectivityStatus::Checking => {}
            }
        });
    })
}

fn spawn_periodic(inner: Weak<CoordinatorInner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let coordinator = SyncCoordinator { inner };
            // Runs detached so stopping the timer never cancels a sync mid-record
            tokio::spawn(async move {
                if let Err(error) = coordinator
                    .trigger_sync(SyncTrigger::Periodic, TriggerOptions::default())
                    .await
                {
                    tracing::warn!("Periodic sync failed: {error}");
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProberSettings, TierPolicy, TierTable};
    use crate::models::{ResolutionRule, ResolutionStrategy, Tier};
    use crate::remote::MemoryRemoteStore;
    use crate::seed::JsonSeedProvider;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn snapshot(value: serde_json::Value) -> Snapshot {
        value.as_object().unwrap().clone()
    }

    fn test_config() -> SatchelConfig {
        let policy = TierPolicy::new(10, 5, vec![Duration::ZERO]);
        SatchelConfig {
            sync: SyncSettings {
                periodic_interval_secs: 0,
                tiers: TierTable {
                    critical: policy.clone(),
                    important: policy.clone(),
                    administrative: policy,
                },
                ..SyncSettings::default()
            },
            prober: ProberSettings {
                dns_target: None,
                tcp_target: None,
                quality_url: None,
                startup_cooldown_ms: 0,
                cooldown_ms: 0,
                monitor_interval_secs: 0,
                ..ProberSettings::default()
            },
            ..SatchelConfig::default()
        }
    }

    async fn setup(config: &SatchelConfig) -> (SyncCoordinator, LocalStore, MemoryRemoteStore) {
        let local = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemoteStore::new();
        let coordinator = SyncCoordinator::new(local.clone(), config);
        (coordinator, local, remote)
    }

    fn as_remote(remote: &MemoryRemoteStore) -> Option<Arc<dyn RemoteStore>> {
        Some(Arc::new(remote.clone()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn calls_before_initialize_are_rejected() {
        let (coordinator, _local, _remote) = setup(&test_config()).await;

        let result = coordinator
            .trigger_sync(SyncTrigger::Periodic, TriggerOptions::default())
            .await;
        assert!(matches!(result, Err(Error::NotInitialized("trigger_sync"))));
        assert!(matches!(
            coordinator
                .queue_operation(SyncOperation::push(
                    EntityKind::Learner,
                    "l1",
                    snapshot(json!({"id": "l1"}))
                ))
                .await,
            Err(Error::NotInitialized("queue_operation"))
        ));
        assert_eq!(coordinator.status(), SyncStatus::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn initialize_is_idempotent_and_pushes_final_attempts() {
        let (coordinator, local, remote) = setup(&test_config()).await;
        local
            .upsert_record(
                EntityKind::Attempt,
                &snapshot(json!({"id": "a1", "is_final": true, "completed_at": 5, "updated_at": 5})),
                false,
            )
            .await
            .unwrap();

        coordinator.initialize(as_remote(&remote)).await.unwrap();
        coordinator.initialize(as_remote(&remote)).await.unwrap();

        assert!(remote.get(EntityKind::Attempt, "a1").await.is_some());
        assert_eq!(local.count_unsynced().await.unwrap(), 0);
        let status = coordinator.status();
        assert!(status.is_online);
        assert!(status.last_sync_at.is_some());
        assert_eq!(
            local.get_metadata(LAST_SYNC_KEY).await.unwrap(),
            status.last_sync_at.map(|at| at.to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_create_is_deferred_then_drained_on_reconnection() {
        let (coordinator, local, remote) = setup(&test_config()).await;
        remote.set_reachable(false).await;
        coordinator.initialize(as_remote(&remote)).await.unwrap();
        assert!(!coordinator.status().is_online);

        local
            .upsert_record(
                EntityKind::Attempt,
                &snapshot(json!({"id": "draft", "answers": {"q1": "b"}, "is_final": false, "updated_at": 10})),
                false,
            )
            .await
            .unwrap();

        let report = coordinator
            .trigger_sync(SyncTrigger::Periodic, TriggerOptions::default())
            .await
            .unwrap();
        assert_eq!(report.outcome, SyncOutcome::Deferred);
        assert!(report.outcome.is_success());
        assert_eq!(remote.len(EntityKind::Attempt).await, 0);
        assert_eq!(coordinator.status().pending_local_changes, 1);

        remote.set_reachable(true).await;
        let report = coordinator
            .trigger_sync(SyncTrigger::NetworkReconnection, TriggerOptions::forced())
            .await
            .unwrap();
        assert_eq!(report.outcome, SyncOutcome::Completed);

        let pushed = remote.get(EntityKind::Attempt, "draft").await.unwrap();
        assert_eq!(pushed["answers"], json!({"q1": "b"}));
        assert_eq!(local.count_unsynced().await.unwrap(), 0);
        assert!(coordinator.status().is_online);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_push_is_queued_then_replayed() {
        let (coordinator, local, remote) = setup(&test_config()).await;
        coordinator.initialize(as_remote(&remote)).await.unwrap();

        local
            .upsert_record(
                EntityKind::Learner,
                &snapshot(json!({"id": "l1", "display_name": "Ada", "updated_at": 3})),
                false,
            )
            .await
            .unwrap();
        remote.fail_next_writes(1).await;

        let report = coordinator
            .trigger_sync(
                SyncTrigger::FullSync,
                TriggerOptions {
                    force: true,
                    priority: Some(Tier::Critical),
                },
            )
            .await
            .unwrap();
        assert_eq!(report.outcome, SyncOutcome::Completed);
        assert_eq!(report.queued, 1);
        assert_eq!(
            coordinator.retry_queue().pending_count(Some(Tier::Critical)).await,
            1
        );
        assert!(local.get_metadata(LAST_FULL_SYNC_KEY).await.unwrap().is_some());

        let report = coordinator
            .trigger_sync(SyncTrigger::NetworkReconnection, TriggerOptions::forced())
            .await
            .unwrap();
        assert_eq!(report.queue.succeeded, 1);
        assert_eq!(coordinator.retry_queue().pending_count(None).await, 0);
        assert!(remote.get(EntityKind::Learner, "l1").await.is_some());
        assert_eq!(local.count_unsynced().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn both_final_attempts_five_seconds_apart_resolve_local_wins() {
        let mut config = test_config();
        config.sync.strategies = BTreeMap::from([(
            EntityKind::Attempt,
            ResolutionStrategy::new(ResolutionRule::LocalWins, false),
        )]);
        let (coordinator, local, remote) = setup(&config).await;

        remote
            .insert(
                EntityKind::Attempt,
                snapshot(json!({
                    "id": "a1", "answers": {"q1": "a"}, "score": 50, "is_final": true,
                    "completed_at": 15_000, "updated_at": 15_000
                })),
            )
            .await;
        local
            .upsert_record(
                EntityKind::Attempt,
                &snapshot(json!({
                    "id": "a1", "answers": {"q1": "c"}, "score": 100, "is_final": true,
                    "completed_at": 10_000, "updated_at": 10_000
                })),
                false,
            )
            .await
            .unwrap();

        coordinator.initialize(as_remote(&remote)).await.unwrap();

        let remote_copy = remote.get(EntityKind::Attempt, "a1").await.unwrap();
        assert_eq!(remote_copy["score"], json!(100));
        assert_eq!(remote_copy["completed_at"], json!(10_000));
        assert_eq!(local.count_unsynced().await.unwrap(), 0);

        let log = local.recent_log(10).await.unwrap();
        let entry = log
            .iter()
            .find(|entry| entry.operation == "conflict_resolution")
            .unwrap();
        assert_eq!(entry.status, SyncLogStatus::Success);
        assert!(entry.details.as_deref().unwrap().starts_with("local_wins"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_non_forced_call_reports_busy() {
        let (coordinator, _local, remote) = setup(&test_config()).await;
        coordinator.initialize(as_remote(&remote)).await.unwrap();

        let guard = coordinator.inner.run_lock.lock().await;
        let report = coordinator
            .trigger_sync(SyncTrigger::RecordProgress, TriggerOptions::default())
            .await
            .unwrap();
        assert_eq!(report.outcome, SyncOutcome::Busy);
        drop(guard);

        let report = coordinator
            .trigger_sync(SyncTrigger::RecordProgress, TriggerOptions::default())
            .await
            .unwrap();
        assert_eq!(report.outcome, SyncOutcome::Completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_empty_store_is_seeded() {
        let local = LocalStore::open_in_memory().await.unwrap();
        let seeder = JsonSeedProvider::from_json(
            local.clone(),
            r#"{"quizzes": [{"id": "q1", "title": "Minerals"}], "questions": []}"#,
        )
        .unwrap();
        let coordinator = SyncCoordinator::builder(local.clone(), test_config())
            .seeder(Arc::new(seeder))
            .build();

        coordinator.initialize(None).await.unwrap();
        assert_eq!(local.count_records(EntityKind::Quiz).await.unwrap(), 1);

        let report = coordinator
            .trigger_sync(SyncTrigger::Startup, TriggerOptions::default())
            .await
            .unwrap();
        assert_eq!(report.outcome, SyncOutcome::Deferred);
        assert_eq!(report.seeded, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn startup_pulls_reference_data_into_empty_store() {
        let (coordinator, local, remote) = setup(&test_config()).await;
        remote
            .insert(
                EntityKind::Quiz,
                snapshot(json!({"id": "q1", "title": "Minerals", "updated_at": 1})),
            )
            .await;
        remote
            .insert(
                EntityKind::Question,
                snapshot(json!({"id": "qq1", "quiz_id": "q1", "prompt": "Hardest?", "position": 0})),
            )
            .await;

        coordinator.initialize(as_remote(&remote)).await.unwrap();

        assert_eq!(local.count_records(EntityKind::Quiz).await.unwrap(), 1);
        assert_eq!(local.count_records(EntityKind::Question).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rows_without_valid_timestamp_are_repaired_before_push() {
        let (coordinator, local, remote) = setup(&test_config()).await;
        coordinator.initialize(as_remote(&remote)).await.unwrap();

        local
            .upsert_record(
                EntityKind::Learner,
                &snapshot(json!({"id": "l1", "display_name": "Ada"})),
                false,
            )
            .await
            .unwrap();

        let report = coordinator
            .trigger_sync(SyncTrigger::FullSync, TriggerOptions::forced())
            .await
            .unwrap();
        assert_eq!(report.pushed, 1);

        let pushed = remote.get(EntityKind::Learner, "l1").await.unwrap();
        assert!(snapshot_updated_at(&pushed).is_some());
        assert_eq!(local.count_unsynced().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_subscribers_see_sync_results() {
        let (coordinator, local, remote) = setup(&test_config()).await;
        let mut receiver = coordinator.subscribe_status();
        local
            .upsert_record(
                EntityKind::Attempt,
                &snapshot(json!({"id": "a1", "is_final": false, "updated_at": 1})),
                false,
            )
            .await
            .unwrap();

        coordinator.initialize(as_remote(&remote)).await.unwrap();
        assert!(receiver.has_changed().unwrap());
        assert_eq!(receiver.borrow_and_update().pending_local_changes, 1);

        coordinator
            .trigger_sync(SyncTrigger::RecordProgress, TriggerOptions::default())
            .await
            .unwrap();
        assert_eq!(receiver.borrow_and_update().pending_local_changes, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cleanup_flushes_queue_and_requires_reinitialize() {
        let (coordinator, local, remote) = setup(&test_config()).await;
        coordinator.initialize(as_remote(&remote)).await.unwrap();

        coordinator
            .queue_operation(SyncOperation::push(
                EntityKind::Learner,
                "l9",
                snapshot(json!({"id": "l9", "updated_at": 1})),
            ))
            .await
            .unwrap();
        remote.set_reachable(false).await;

        coordinator.cleanup().await.unwrap();
        assert_eq!(local.list_queued().await.unwrap().len(), 1);
        assert!(matches!(
            coordinator
                .trigger_sync(SyncTrigger::Periodic, TriggerOptions::default())
                .await,
            Err(Error::NotInitialized(_))
        ));
    }

    async fn seed_pending_rows(local: &LocalStore) {
        for row in [
            json!({"id": "f1", "answers": {"q1": "a"}, "is_final": true, "completed_at": 5, "updated_at": 5}),
            json!({"id": "d1", "answers": {"q1": "b"}, "is_final": false, "updated_at": 6}),
        ] {
            local
                .upsert_record(EntityKind::Attempt, &snapshot(row), false)
                .await
                .unwrap();
        }
        local
            .upsert_record(
                EntityKind::Learner,
                &snapshot(json!({"id": "l1", "display_name": "Ada", "updated_at": 7})),
                false,
            )
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn record_finalized_checkpoints_then_pushes_only_final_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let local = LocalStore::open_path(tmp.path().join("satchel.db"))
            .await
            .unwrap();
        let remote = MemoryRemoteStore::new();
        let coordinator = SyncCoordinator::new(local.clone(), &test_config());
        coordinator.initialize(as_remote(&remote)).await.unwrap();
        seed_pending_rows(&local).await;

        let report = coordinator
            .trigger_sync(SyncTrigger::RecordFinalized, TriggerOptions::forced())
            .await
            .unwrap();
        assert_eq!(report.outcome, SyncOutcome::Completed);
        assert_eq!(report.pushed, 1);

        assert!(remote.get(EntityKind::Attempt, "f1").await.is_some());
        assert!(remote.get(EntityKind::Attempt, "d1").await.is_none());
        assert!(remote.get(EntityKind::Learner, "l1").await.is_none());
        assert_eq!(local.count_unsynced().await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn periodic_and_progress_push_only_in_progress_attempts() {
        let (coordinator, local, remote) = setup(&test_config()).await;
        coordinator.initialize(as_remote(&remote)).await.unwrap();
        seed_pending_rows(&local).await;

        let report = coordinator
            .trigger_sync(SyncTrigger::Periodic, TriggerOptions::default())
            .await
            .unwrap();
        assert_eq!(report.pushed, 1);
        assert!(remote.get(EntityKind::Attempt, "d1").await.is_some());

        local
            .upsert_record(
                EntityKind::Attempt,
                &snapshot(json!({"id": "d2", "answers": {}, "is_final": false, "updated_at": 8})),
                false,
            )
            .await
            .unwrap();
        let report = coordinator
            .trigger_sync(SyncTrigger::RecordProgress, TriggerOptions::default())
            .await
            .unwrap();
        assert_eq!(report.pushed, 1);
        assert!(remote.get(EntityKind::Attempt, "d2").await.is_some());

        assert!(remote.get(EntityKind::Attempt, "f1").await.is_none());
        assert!(remote.get(EntityKind::Learner, "l1").await.is_none());
        assert_eq!(local.count_unsynced().await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cleanup_pushes_final_attempts_while_online() {
        let (coordinator, local, remote) = setup(&test_config()).await;
        coordinator.initialize(as_remote(&remote)).await.unwrap();
        seed_pending_rows(&local).await;
        assert!(coordinator.status().is_online);

        coordinator.cleanup().await.unwrap();

        assert!(remote.get(EntityKind::Attempt, "f1").await.is_some());
        assert!(remote.get(EntityKind::Attempt, "d1").await.is_none());
        assert_eq!(local.count_unsynced().await.unwrap(), 2);

        let log = local.recent_log(10).await.unwrap();
        assert!(log.iter().any(|entry| entry.record_id == "f1"
            && entry.status == SyncLogStatus::Success
            && entry.details.as_deref() == Some("shutdown")));
        assert!(!coordinator.is_initialized().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_draft_yields_to_remote_submission_on_reconnection() {
        let (coordinator, local, remote) = setup(&test_config()).await;
        coordinator.initialize(as_remote(&remote)).await.unwrap();

        local
            .upsert_record(
                EntityKind::Attempt,
                &snapshot(json!({"id": "a1", "answers": {"q1": "a"}, "is_final": false, "updated_at": 10})),
                false,
            )
            .await
            .unwrap();
        remote.fail_next_writes(1).await;
        let report = coordinator
            .trigger_sync(SyncTrigger::RecordProgress, TriggerOptions::default())
            .await
            .unwrap();
        assert_eq!(report.queued, 1);

        remote
            .insert(
                EntityKind::Attempt,
                snapshot(json!({
                    "id": "a1", "answers": {"q1": "b"}, "is_final": true,
                    "completed_at": 20, "updated_at": 20
                })),
            )
            .await;

        let report = coordinator
            .trigger_sync(SyncTrigger::NetworkReconnection, TriggerOptions::forced())
            .await
            .unwrap();
        assert_eq!(report.queue.succeeded, 1);
        assert_eq!(report.queue.conflicts_resolved, 1);
        assert_eq!(report.conflicts_resolved, 1);

        let remote_copy = remote.get(EntityKind::Attempt, "a1").await.unwrap();
        assert_eq!(remote_copy["is_final"], json!(true));
        assert_eq!(remote_copy["answers"], json!({"q1": "b"}));
        let local_copy = local
            .get_record(EntityKind::Attempt, "a1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local_copy["answers"], json!({"q1": "b"}));
        assert_eq!(local.count_unsynced().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_failures_keep_one_queued_operation_per_record() {
        let (coordinator, local, remote) = setup(&test_config()).await;
        coordinator.initialize(as_remote(&remote)).await.unwrap();

        local
            .upsert_record(
                EntityKind::Attempt,
                &snapshot(json!({"id": "d1", "answers": {"q1": "a"}, "is_final": false, "updated_at": 10})),
                false,
            )
            .await
            .unwrap();
        remote.fail_next_writes(2).await;

        for _ in 0..2 {
            let report = coordinator
                .trigger_sync(SyncTrigger::Periodic, TriggerOptions::default())
                .await
                .unwrap();
            assert_eq!(report.queued, 1);
        }

        assert_eq!(coordinator.retry_queue().pending_count(None).await, 1);
        assert_eq!(local.list_queued().await.unwrap().len(), 1);
    }
}
