//! Runtime configuration for the sync subsystem.
//!
//! `SatchelConfig` is read from an optional JSON file; every field has a
//! default so an empty object is a valid configuration. Remote credentials
//! may also come from `SATCHEL_REMOTE_URL` / `SATCHEL_AUTH_TOKEN`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{EntityKind, ResolutionRule, ResolutionStrategy, Tier};
use crate::util::{is_http_url, normalize_text_option};

/// Environment variable holding the remote database URL
pub const REMOTE_URL_ENV: &str = "SATCHEL_REMOTE_URL";
/// Environment variable holding the remote auth token
pub const AUTH_TOKEN_ENV: &str = "SATCHEL_AUTH_TOKEN";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SatchelConfig {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub prober: ProberSettings,
}

impl SatchelConfig {
    /// Parse a configuration from a JSON payload.
    pub fn from_json(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)
            .map_err(|error| Error::Config(format!("invalid config JSON: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, falling back to defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let payload = std::fs::read_to_string(path)?;
        Self::from_json(&payload)
    }

    /// Overlay remote credentials from the environment.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = normalize_text_option(std::env::var(REMOTE_URL_ENV).ok()) {
            self.remote.url = Some(url);
        }
        if let Some(token) = normalize_text_option(std::env::var(AUTH_TOKEN_ENV).ok()) {
            self.remote.auth_token = Some(token);
        }
        self
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = normalize_text_option(self.remote.url.clone()) {
            if !is_remote_url(&url) {
                return Err(Error::Config(
                    "remote.url must include libsql://, http:// or https://".to_string(),
                ));
            }
        }
        for tier in Tier::ALL {
            let policy = self.sync.tiers.policy(tier);
            if policy.batch_size == 0 {
                return Err(Error::Config(format!(
                    "sync.tiers.{tier}.batch_size must be positive"
                )));
            }
            if policy.backoff_ms.windows(2).any(|pair| pair[0] > pair[1]) {
                return Err(Error::Config(format!(
                    "sync.tiers.{tier}.backoff_ms must be non-decreasing"
                )));
            }
        }
        if self.prober.probe_timeout_ms == 0 {
            return Err(Error::Config(
                "prober.probe_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_remote_url(value: &str) -> bool {
    is_http_url(value) || value.starts_with("libsql://")
}

/// Remote store connection settings
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Remote database URL (e.g., `libsql://your-db.turso.io`)
    #[serde(default)]
    pub url: Option<String>,
    /// Authentication token for the remote database
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl RemoteConfig {
    /// Create a remote configuration
    pub fn new(url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            auth_token: Some(auth_token.into()),
        }
    }

    /// Check if the remote store is configured
    pub fn is_configured(&self) -> bool {
        normalize_text_option(self.url.clone()).is_some()
            && normalize_text_option(self.auth_token.clone()).is_some()
    }
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Batch size, retry budget and backoff schedule of one tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TierPolicy {
    /// Operations attempted per batch
    pub batch_size: usize,
    /// Retries allowed before an operation is abandoned
    pub max_retries: u32,
    /// Delays applied after successive failures; the last one repeats
    pub backoff_ms: Vec<u64>,
}

impl TierPolicy {
    /// Create a policy from a backoff schedule
    pub fn new(batch_size: usize, max_retries: u32, backoff: Vec<Duration>) -> Self {
        Self {
            batch_size,
            max_retries,
            backoff_ms: backoff
                .into_iter()
                .map(|delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
                .collect(),
        }
    }

    /// Delay before the next attempt after `retry_count` failures.
    ///
    /// The schedule is indexed from the first failure; once it is exhausted
    /// the last entry repeats.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let index = usize::try_from(retry_count - 1).unwrap_or(usize::MAX);
        self.backoff_ms
            .get(index)
            .or_else(|| self.backoff_ms.last())
            .map_or(Duration::ZERO, |ms| Duration::from_millis(*ms))
    }
}

/// Policies for every tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TierTable {
    pub critical: TierPolicy,
    pub important: TierPolicy,
    pub administrative: TierPolicy,
}

impl TierTable {
    /// Policy of a tier
    pub const fn policy(&self, tier: Tier) -> &TierPolicy {
        match tier {
            Tier::Critical => &self.critical,
            Tier::Important => &self.important,
            Tier::Administrative => &self.administrative,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        let secs = Duration::from_secs;
        Self {
            critical: TierPolicy::new(10, 10, vec![secs(1), secs(2), secs(5), secs(10), secs(30)]),
            important: TierPolicy::new(
                25,
                6,
                vec![secs(5), secs(15), secs(30), secs(60), secs(300)],
            ),
            administrative: TierPolicy::new(
                50,
                4,
                vec![secs(30), secs(120), secs(600), secs(1800)],
            ),
        }
    }
}

/// Coordinator, queue and resolver settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Interval of the periodic trigger
    pub periodic_interval_secs: u64,
    /// Upper bound on the final sync during shutdown
    pub shutdown_timeout_secs: u64,
    /// Timestamp differences up to this value are treated as clock skew
    pub conflict_tolerance_ms: i64,
    /// Per-tier queue policies
    pub tiers: TierTable,
    /// Resolution strategy overrides per entity
    pub strategies: BTreeMap<EntityKind, ResolutionStrategy>,
}

impl SyncSettings {
    pub const fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }

    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Built-in strategies with configured overrides applied
    pub fn strategy_table(&self) -> BTreeMap<EntityKind, ResolutionStrategy> {
        let mut table = default_strategies();
        table.extend(self.strategies.iter().map(|(kind, strategy)| (*kind, *strategy)));
        table
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            periodic_interval_secs: 300,
            shutdown_timeout_secs: 10,
            conflict_tolerance_ms: 1_000,
            tiers: TierTable::default(),
            strategies: BTreeMap::new(),
        }
    }
}

fn default_strategies() -> BTreeMap<EntityKind, ResolutionStrategy> {
    BTreeMap::from([
        (
            EntityKind::Attempt,
            ResolutionStrategy::new(ResolutionRule::MergeData, true),
        ),
        (
            EntityKind::Learner,
            ResolutionStrategy::new(ResolutionRule::TimestampWins, true),
        ),
        (
            EntityKind::Quiz,
            ResolutionStrategy::new(ResolutionRule::RemoteWins, false),
        ),
        (
            EntityKind::Question,
            ResolutionStrategy::new(ResolutionRule::RemoteWins, false),
        ),
    ])
}

/// Connectivity prober settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProberSettings {
    /// Well-known host name resolved by the DNS probe (`host:port`)
    pub dns_target: Option<String>,
    /// Well-known address for the direct TCP probe (`ip:port`)
    pub tcp_target: Option<String>,
    /// Optional URL timed by the connection quality test
    pub quality_url: Option<String>,
    /// Per-probe timeout
    pub probe_timeout_ms: u64,
    /// Length of the startup grace period
    pub startup_grace_secs: u64,
    /// Minimum spacing of checks during the grace period
    pub startup_cooldown_ms: u64,
    /// Minimum spacing of checks afterwards
    pub cooldown_ms: u64,
    /// Interval of background monitoring
    pub monitor_interval_secs: u64,
}

impl ProberSettings {
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub const fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub const fn startup_cooldown(&self) -> Duration {
        Duration::from_millis(self.startup_cooldown_ms)
    }

    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

impl Default for ProberSettings {
    fn default() -> Self {
        Self {
            dns_target: Some("dns.google:443".to_string()),
            tcp_target: Some("1.1.1.1:443".to_string()),
            quality_url: None,
            probe_timeout_ms: 3_000,
            startup_grace_secs: 30,
            startup_cooldown_ms: 2_000,
            cooldown_ms: 15_000,
            monitor_interval_secs: 30,
        }
    }
}
