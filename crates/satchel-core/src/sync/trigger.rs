//! Sync triggers, per-run options and run reports.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::queue::QueueSummary;
use crate::error::Error;
use crate::models::Tier;
use crate::util::now_ms;

/// Event that starts a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Application start
    Startup,
    /// A record was submitted
    RecordFinalized,
    /// An in-progress record changed
    RecordProgress,
    /// The remote store became reachable again
    NetworkReconnection,
    /// Background timer
    Periodic,
    /// Explicit request to synchronize everything
    FullSync,
    /// Application shutdown
    Shutdown,
}

impl SyncTrigger {
    /// Every trigger
    pub const ALL: [Self; 7] = [
        Self::Startup,
        Self::RecordFinalized,
        Self::RecordProgress,
        Self::NetworkReconnection,
        Self::Periodic,
        Self::FullSync,
        Self::Shutdown,
    ];

    /// Stable name used in logs and on the command line
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::RecordFinalized => "record_finalized",
            Self::RecordProgress => "record_progress",
            Self::NetworkReconnection => "network_reconnection",
            Self::Periodic => "periodic",
            Self::FullSync => "full_sync",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncTrigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|trigger| trigger.as_str() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("unknown sync trigger: {s}")))
    }
}

/// Options for a single `trigger_sync` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerOptions {
    /// Wait for an in-flight run instead of returning `Busy`
    pub force: bool,
    /// Tier for operations queued by this run, overriding classification
    pub priority: Option<Tier>,
}

impl TriggerOptions {
    /// Options for a forced run
    pub const fn forced() -> Self {
        Self {
            force: true,
            priority: None,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The strategy ran to completion (individual records may have been queued)
    Completed,
    /// Offline; work stays queued
    Deferred,
    /// Another run was in flight
    Busy,
    /// The strategy failed
    Failed,
}

impl SyncOutcome {
    /// Whether the caller should treat the run as successful
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::Deferred)
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Deferred => "deferred",
            Self::Busy => "busy",
            Self::Failed => "failed",
        })
    }
}

/// Summary of one `trigger_sync` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Trigger that started the run
    pub trigger: SyncTrigger,
    /// How the run ended
    pub outcome: SyncOutcome,
    /// Records written to the remote store
    pub pushed: usize,
    /// Records skipped by validation
    pub skipped: usize,
    /// Conflicts resolved
    pub conflicts_resolved: usize,
    /// Operations handed to the retry queue
    pub queued: usize,
    /// Reference rows pulled from the remote store
    pub pulled: u64,
    /// Reference rows written by the fallback seeder
    pub seeded: u64,
    /// Retry queue pass counts
    pub queue: QueueSummary,
    /// Explanation for deferred or failed runs
    pub message: Option<String>,
    /// Run start (unix ms)
    pub started_at: i64,
    /// Run end (unix ms)
    pub finished_at: i64,
}

impl SyncReport {
    pub(crate) fn new(trigger: SyncTrigger) -> Self {
        let now = now_ms();
        Self {
            trigger,
            outcome: SyncOutcome::Completed,
            pushed: 0,
            skipped: 0,
            conflicts_resolved: 0,
            queued: 0,
            pulled: 0,
            seeded: 0,
            queue: QueueSummary::default(),
            message: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub(crate) fn finish(mut self, outcome: SyncOutcome, message: Option<String>) -> Self {
        self.outcome = outcome;
        self.message = message;
        self.finished_at = now_ms();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_names_round_trip() {
        for trigger in SyncTrigger::ALL {
            assert_eq!(trigger.as_str().parse::<SyncTrigger>().unwrap(), trigger);
        }
        assert_eq!(
            "full-sync".parse::<SyncTrigger>().unwrap(),
            SyncTrigger::FullSync
        );
        assert!("sometimes".parse::<SyncTrigger>().is_err());
    }

    #[test]
    fn deferred_counts_as_success() {
        assert!(SyncOutcome::Deferred.is_success());
        assert!(!SyncOutcome::Busy.is_success());
        assert!(!SyncOutcome::Failed.is_success());
    }
}
