//! Active network reachability probing with change notifications.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::ProberSettings;
use crate::models::ConnectivityStatus;
use crate::remote::RemoteStore;
use crate::util::now_ms;

/// Callback invoked on an online/offline transition
pub type ConnectivityCallback = Arc<dyn Fn(ConnectivityStatus) + Send + Sync>;

/// Handle returned by [`ConnectivityProber::on_connectivity_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Which probe answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Round trip to the remote store
    RemoteStore,
    /// DNS resolution of a well-known name
    Dns,
    /// TCP connect to a well-known address
    Tcp,
    /// HTTP request to the configured quality URL
    Http,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RemoteStore => "remote_store",
            Self::Dns => "dns",
            Self::Tcp => "tcp",
            Self::Http => "http",
        })
    }
}

/// Latency bucket of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    /// Under 100 ms
    Excellent,
    /// Under 300 ms
    Good,
    /// Under 1 s
    Fair,
    /// 1 s or more
    Poor,
    /// No probe answered
    Unreachable,
}

impl ConnectionQuality {
    /// Bucket a measured round trip
    pub const fn from_latency(latency: Duration) -> Self {
        match latency.as_millis() {
            0..=99 => Self::Excellent,
            100..=299 => Self::Good,
            300..=999 => Self::Fair,
            _ => Self::Poor,
        }
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Unreachable => "unreachable",
        })
    }
}

/// Snapshot of the prober's knowledge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    /// Current status
    pub status: ConnectivityStatus,
    /// Last completed check (unix ms)
    pub last_checked_at: Option<i64>,
    /// Probe that answered the last successful check
    pub answered_by: Option<ProbeKind>,
    /// Round trip of that probe
    pub latency_ms: Option<u64>,
    /// Best-effort classification of that round trip
    pub quality: Option<ConnectionQuality>,
}

/// Result of [`ConnectivityProber::test_connection_quality`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityReport {
    /// Latency bucket
    pub quality: ConnectionQuality,
    /// Measured round trip
    pub latency_ms: Option<u64>,
    /// Probe used
    pub probe: Option<ProbeKind>,
}

struct ProbeState {
    status: ConnectivityStatus,
    last_check: Option<Instant>,
    last_checked_at: Option<i64>,
    answered_by: Option<ProbeKind>,
    latency: Option<Duration>,
}

#[derive(Default)]
struct MonitorState {
    handle: Option<JoinHandle<()>>,
    interval: Option<Duration>,
}

struct ProberInner {
    settings: ProberSettings,
    remote: Option<Arc<dyn RemoteStore>>,
    http: reqwest::Client,
    started_at: Instant,
    check_lock: Mutex<()>,
    state: Mutex<ProbeState>,
    subscribers: Mutex<BTreeMap<SubscriptionId, ConnectivityCallback>>,
    next_subscription: AtomicU64,
    monitor: Mutex<MonitorState>,
    closed: AtomicBool,
}

/// Determines whether the remote store is reachable.
///
/// Probes run in order (remote store, DNS, TCP) and the first success wins.
/// Results are cached for a cooldown window that is shorter during the
/// startup grace period.
#[derive(Clone)]
pub struct ConnectivityProber {
    inner: Arc<ProberInner>,
}

impl ConnectivityProber {
    /// Create a prober; nothing runs until `initialize` or a check
    pub fn new(settings: ProberSettings, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        Self {
            inner: Arc::new(ProberInner {
                settings,
                remote,
                http: reqwest::Client::new(),
                started_at: Instant::now(),
                check_lock: Mutex::new(()),
                state: Mutex::new(ProbeState {
                    status: ConnectivityStatus::Checking,
                    last_check: None,
                    last_checked_at: None,
                    answered_by: None,
                    latency: None,
                }),
                subscribers: Mutex::new(BTreeMap::new()),
                next_subscription: AtomicU64::new(1),
                monitor: Mutex::new(MonitorState::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Start one check in the background and return immediately
    pub fn initialize(&self) {
        let prober = self.clone();
        tokio::spawn(async move {
            prober.check_connectivity().await;
        });
    }

    fn cooldown(&self) -> Duration {
        if self.inner.started_at.elapsed() < self.inner.settings.startup_grace() {
            self.inner.settings.startup_cooldown()
        } else {
            self.inner.settings.cooldown()
        }
    }

    /// Check reachability, returning the cached answer inside the cooldown.
    pub async fn check_connectivity(&self) -> bool {
        let _check = self.inner.check_lock.lock().await;

        {
            let state = self.inner.state.lock().await;
            if let Some(last_check) = state.last_check {
                if last_check.elapsed() < self.cooldown() {
                    return state.status.is_online();
                }
            }
        }

        let answer = self.run_probes().await;
        let online = answer.is_some();
        let next = if online {
            ConnectivityStatus::Online
        } else {
            ConnectivityStatus::Offline
        };

        let previous = {
            let mut state = self.inner.state.lock().await;
            let previous = state.status;
            state.status = next;
            state.last_check = Some(Instant::now());
            state.last_checked_at = Some(now_ms());
            if let Some((probe, latency)) = answer {
                state.answered_by = Some(probe);
                state.latency = Some(latency);
            }
            previous
        };

        if previous != ConnectivityStatus::Checking && previous != next {
            tracing::info!("Connectivity changed: {previous} -> {next}");
            if online {
                self.rearm_monitoring().await;
            }
            self.notify(next).await;
        } else {
            tracing::debug!("Connectivity check: {next}");
        }
        online
    }

    async fn run_probes(&self) -> Option<(ProbeKind, Duration)> {
        let probe_timeout = self.inner.settings.probe_timeout();

        if let Some(remote) = &self.inner.remote {
            let started = Instant::now();
            if timeout(probe_timeout, remote.is_reachable_now())
                .await
                .unwrap_or(false)
            {
                return Some((ProbeKind::RemoteStore, started.elapsed()));
            }
        }

        if let Some(target) = self.inner.settings.dns_target.as_deref() {
            let started = Instant::now();
            let resolved = timeout(probe_timeout, lookup_host(target))
                .await
                .ok()
                .and_then(Result::ok)
                .is_some_and(|mut addrs| addrs.next().is_some());
            if resolved {
                return Some((ProbeKind::Dns, started.elapsed()));
            }
        }

        if let Some(target) = self.inner.settings.tcp_target.as_deref() {
            let started = Instant::now();
            let connected = matches!(timeout(probe_timeout, TcpStream::connect(target)).await, Ok(Ok(_)));
            if connected {
                return Some((ProbeKind::Tcp, started.elapsed()));
            }
        }

        None
    }

    async fn notify(&self, status: ConnectivityStatus) {
        let callbacks: Vec<ConnectivityCallback> =
            self.inner.subscribers.lock().await.values().cloned().collect();
        for callback in callbacks {
            callback(status);
        }
    }

    /// Current status without probing
    pub async fn status(&self) -> ConnectivityStatus {
        self.inner.state.lock().await.status
    }

    /// Details of the last check
    pub async fn network_info(&self) -> NetworkInfo {
        let state = self.inner.state.lock().await;
        NetworkInfo {
            status: state.status,
            last_checked_at: state.last_checked_at,
            answered_by: state.answered_by,
            latency_ms: state.latency.map(duration_ms),
            quality: state.latency.map(ConnectionQuality::from_latency),
        }
    }

    /// Register a transition callback
    pub async fn on_connectivity_change(&self, callback: ConnectivityCallback) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.inner.subscribers.lock().await.insert(id, callback);
        id
    }

    /// Remove a transition callback
    pub async fn off_connectivity_change(&self, id: SubscriptionId) {
        self.inner.subscribers.lock().await.remove(&id);
    }

    /// Re-check on a fixed interval until stopped
    pub async fn start_monitoring(&self, interval: Duration) {
        if self.inner.closed.load(Ordering::SeqCst) || interval.is_zero() {
            return;
        }

        let mut monitor = self.inner.monitor.lock().await;
        if let Some(handle) = monitor.handle.take() {
            handle.abort();
        }
        monitor.interval = Some(interval);
        monitor.handle = Some(spawn_monitor(Arc::downgrade(&self.inner), interval));
        tracing::debug!("Connectivity monitoring every {interval:?}");
    }

    /// Stop the monitoring timer; the interval is remembered
    pub async fn stop_monitoring(&self) {
        if let Some(handle) = self.inner.monitor.lock().await.handle.take() {
            handle.abort();
        }
    }

    /// Whether the monitoring timer is running
    pub async fn is_monitoring(&self) -> bool {
        self.inner
            .monitor
            .lock()
            .await
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn rearm_monitoring(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let interval = {
            let monitor = self.inner.monitor.lock().await;
            let running = monitor
                .handle
                .as_ref()
                .is_some_and(|handle| !handle.is_finished());
            if running {
                return;
            }
            monitor.interval
        };
        if let Some(interval) = interval {
            self.start_monitoring(interval).await;
        }
    }

    /// Timed probe for diagnostics; bypasses the cooldown cache.
    pub async fn test_connection_quality(&self) -> QualityReport {
        let probe_timeout = self.inner.settings.probe_timeout();

        let measured = if let Some(url) = self.inner.settings.quality_url.as_deref() {
            let started = Instant::now();
            let response = timeout(probe_timeout, self.inner.http.head(url).send()).await;
            match response {
                Ok(Ok(_)) => Some((ProbeKind::Http, started.elapsed())),
                _ => None,
            }
        } else {
            self.run_probes().await
        };

        match measured {
            Some((probe, latency)) => QualityReport {
                quality: ConnectionQuality::from_latency(latency),
                latency_ms: Some(duration_ms(latency)),
                probe: Some(probe),
            },
            None => QualityReport {
                quality: ConnectionQuality::Unreachable,
                latency_ms: None,
                probe: None,
            },
        }
    }

    /// Stop monitoring and drop every subscriber
    pub async fn cleanup(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.stop_monitoring().await;
        self.inner.subscribers.lock().await.clear();
    }
}

fn spawn_monitor(inner: Weak<ProberInner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            ConnectivityProber { inner }.check_connectivity().await;
        }
    })
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use std::sync::atomic::AtomicUsize;

    fn remote_only_settings() -> ProberSettings {
        ProberSettings {
            dns_target: None,
            tcp_target: None,
            quality_url: None,
            startup_cooldown_ms: 0,
            cooldown_ms: 0,
            ..ProberSettings::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_probes_means_offline() {
        let prober = ConnectivityProber::new(remote_only_settings(), None);
        assert_eq!(prober.status().await, ConnectivityStatus::Checking);
        assert!(!prober.check_connectivity().await);
        assert_eq!(prober.status().await, ConnectivityStatus::Offline);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_probe_answers_first() {
        let remote = MemoryRemoteStore::new();
        let prober = ConnectivityProber::new(remote_only_settings(), Some(Arc::new(remote)));

        assert!(prober.check_connectivity().await);
        let info = prober.network_info().await;
        assert_eq!(info.status, ConnectivityStatus::Online);
        assert_eq!(info.answered_by, Some(ProbeKind::RemoteStore));
        assert!(info.last_checked_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribers_see_only_transitions() {
        let remote = MemoryRemoteStore::new();
        let prober =
            ConnectivityProber::new(remote_only_settings(), Some(Arc::new(remote.clone())));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let id = prober
            .on_connectivity_change(Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        // Checking -> online is the initial result, not a transition
        prober.check_connectivity().await;
        prober.check_connectivity().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        remote.set_reachable(false).await;
        prober.check_connectivity().await;
        prober.check_connectivity().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        prober.off_connectivity_change(id).await;
        remote.set_reachable(true).await;
        prober.check_connectivity().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cooldown_returns_cached_status() {
        let remote = MemoryRemoteStore::new();
        let settings = ProberSettings {
            startup_cooldown_ms: 60_000,
            ..remote_only_settings()
        };
        let prober = ConnectivityProber::new(settings, Some(Arc::new(remote.clone())));

        assert!(prober.check_connectivity().await);
        remote.set_reachable(false).await;
        assert!(prober.check_connectivity().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn monitoring_rearms_on_reconnection() {
        let remote = MemoryRemoteStore::new();
        remote.set_reachable(false).await;
        let prober =
            ConnectivityProber::new(remote_only_settings(), Some(Arc::new(remote.clone())));

        prober.check_connectivity().await;
        prober.start_monitoring(Duration::from_secs(3600)).await;
        assert!(prober.is_monitoring().await);
        prober.stop_monitoring().await;
        assert!(!prober.is_monitoring().await);

        remote.set_reachable(true).await;
        assert!(prober.check_connectivity().await);
        assert!(prober.is_monitoring().await);

        prober.cleanup().await;
        assert!(!prober.is_monitoring().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn quality_is_unreachable_without_probes() {
        let prober = ConnectivityProber::new(remote_only_settings(), None);
        let report = prober.test_connection_quality().await;
        assert_eq!(report.quality, ConnectionQuality::Unreachable);
        assert_eq!(report.latency_ms, None);
    }

    #[test]
    fn latency_buckets() {
        assert_eq!(
            ConnectionQuality::from_latency(Duration::from_millis(40)),
            ConnectionQuality::Excellent
        );
        assert_eq!(
            ConnectionQuality::from_latency(Duration::from_millis(250)),
            ConnectionQuality::Good
        );
        assert_eq!(
            ConnectionQuality::from_latency(Duration::from_millis(999)),
            ConnectionQuality::Fair
        );
        assert_eq!(
            ConnectionQuality::from_latency(Duration::from_secs(2)),
            ConnectionQuality::Poor
        );
    }
}
