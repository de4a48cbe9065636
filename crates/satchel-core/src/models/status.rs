//! Sync status, connectivity and audit log models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Process-wide sync status, written only by the coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Timestamp (unix ms) of the most recent successful sync
    pub last_sync_at: Option<i64>,
    /// Whether the remote store was reachable at the last check
    pub is_online: bool,
    /// Local changes not yet in the remote store
    pub pending_local_changes: u64,
    /// Remote changes not yet pulled
    pub pending_remote_changes: u64,
    /// Whether a sync strategy is running
    pub sync_in_progress: bool,
}

/// Reachability of the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    /// At least one probe succeeded
    Online,
    /// Every probe failed
    Offline,
    /// A check is running and no prior result exists
    Checking,
}

impl ConnectivityStatus {
    /// Whether sync may use the network
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Checking => "checking",
        })
    }
}

/// Status column of the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncLogStatus {
    /// Completed
    Success,
    /// Failed (see `error_message`)
    Failed,
    /// Deferred to the retry queue
    Pending,
}

impl SyncLogStatus {
    /// Stable name used in durable storage
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Pending => "pending",
        }
    }
}

impl FromStr for SyncLogStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "pending" => Ok(Self::Pending),
            other => Err(Error::InvalidInput(format!("unknown log status: {other}"))),
        }
    }
}

/// One row of the append-only sync audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Row identifier
    pub id: i64,
    /// What was attempted (`push`, `pull`, `conflict_resolution`, ...)
    pub operation: String,
    /// Table involved
    pub table_name: String,
    /// Record involved
    pub record_id: String,
    /// Outcome
    pub status: SyncLogStatus,
    /// Error text for failures
    pub error_message: Option<String>,
    /// Strategy or free-form detail
    pub details: Option<String>,
    /// Attempt start (unix ms)
    pub attempted_at: i64,
    /// Attempt end (unix ms)
    pub completed_at: Option<i64>,
}

impl SyncLogEntry {
    /// A new entry stamped with the current time; `id` is assigned on insert
    pub fn new(
        operation: impl Into<String>,
        table_name: impl Into<String>,
        record_id: impl Into<String>,
        status: SyncLogStatus,
    ) -> Self {
        let now = crate::util::now_ms();
        Self {
            id: 0,
            operation: operation.into(),
            table_name: table_name.into(),
            record_id: record_id.into(),
            status,
            error_message: None,
            details: None,
            attempted_at: now,
            completed_at: (status != SyncLogStatus::Pending).then_some(now),
        }
    }

    /// Attach an error message
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    /// Attach strategy or free-form detail
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}
