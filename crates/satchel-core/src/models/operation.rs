//! Sync operation and queue bookkeeping models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{attempt_is_final, EntityKind, Snapshot};
use crate::config::TierPolicy;
use crate::error::Error;
use crate::util::now_ms;

/// A unique identifier for a sync operation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new unique operation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Direction of a sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Local record to remote store
    Push,
    /// Remote record to local store
    Pull,
    /// Resolved snapshot that still has to reach the remote store
    ConflictResolution,
}

impl OperationKind {
    /// Stable name used in durable storage
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::ConflictResolution => "conflict_resolution",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            "conflict_resolution" => Ok(Self::ConflictResolution),
            other => Err(Error::InvalidInput(format!("unknown operation kind: {other}"))),
        }
    }
}

/// Priority class of a queued operation, highest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Submitted results
    Critical,
    /// In-progress state
    Important,
    /// Everything else
    Administrative,
}

impl Tier {
    /// Tiers in processing order
    pub const ALL: [Self; 3] = [Self::Critical, Self::Important, Self::Administrative];

    /// Deterministic tier for an operation.
    ///
    /// A push of a submitted attempt is critical, a push of an in-progress
    /// attempt or any conflict resolution is important, and everything else
    /// is administrative.
    pub fn classify(kind: OperationKind, entity: EntityKind, payload: &Snapshot) -> Self {
        match (kind, entity) {
            (OperationKind::Push, EntityKind::Attempt) if attempt_is_final(payload) => {
                Self::Critical
            }
            (OperationKind::Push, EntityKind::Attempt) | (OperationKind::ConflictResolution, _) => {
                Self::Important
            }
            _ => Self::Administrative,
        }
    }

    /// Stable name used in durable storage
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Important => "important",
            Self::Administrative => "administrative",
        }
    }

    /// Position in [`Tier::ALL`]
    pub const fn index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::Important => 1,
            Self::Administrative => 2,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "critical" => Ok(Self::Critical),
            "important" => Ok(Self::Important),
            "administrative" => Ok(Self::Administrative),
            other => Err(Error::InvalidInput(format!("unknown tier: {other}"))),
        }
    }
}

/// An intent to move one record between stores.
///
/// The payload is always a full snapshot so replaying an operation is
/// idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Unique identifier
    pub id: OperationId,
    /// Direction
    pub kind: OperationKind,
    /// Target table
    pub entity: EntityKind,
    /// Target record id
    pub record_id: String,
    /// Complete record snapshot at enqueue time
    pub payload: Snapshot,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl SyncOperation {
    /// Create a new operation stamped with the current time
    #[must_use]
    pub fn new(
        kind: OperationKind,
        entity: EntityKind,
        record_id: impl Into<String>,
        payload: Snapshot,
    ) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            entity,
            record_id: record_id.into(),
            payload,
            created_at: now_ms(),
        }
    }

    /// Push of a local snapshot
    #[must_use]
    pub fn push(entity: EntityKind, record_id: impl Into<String>, payload: Snapshot) -> Self {
        Self::new(OperationKind::Push, entity, record_id, payload)
    }

    /// Tier this operation belongs to absent an override
    pub fn tier(&self) -> Tier {
        Tier::classify(self.kind, self.entity, &self.payload)
    }
}

/// A [`SyncOperation`] annotated with queue bookkeeping.
///
/// Values are never mutated in place: a failed attempt produces a new value
/// via [`QueuedOperation::with_failure`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// The operation itself
    pub operation: SyncOperation,
    /// Queue tier
    pub tier: Tier,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Earliest next attempt (Unix ms); `None` means eligible now
    pub next_retry_at: Option<i64>,
    /// Error from the most recent attempt
    pub last_error: Option<String>,
}

impl QueuedOperation {
    /// Wrap a fresh operation
    #[must_use]
    pub const fn new(operation: SyncOperation, tier: Tier) -> Self {
        Self {
            operation,
            tier,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
        }
    }

    /// Whether the operation may be attempted at `now_ms`
    pub fn is_eligible(&self, now_ms: i64) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now_ms)
    }

    /// The value that replaces this one after a failed attempt
    #[must_use]
    pub fn with_failure(&self, error: impl Into<String>, policy: &TierPolicy, now_ms: i64) -> Self {
        let retry_count = self.retry_count.saturating_add(1);
        let delay = policy.backoff_delay(retry_count);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        Self {
            operation: self.operation.clone(),
            tier: self.tier,
            retry_count,
            next_retry_at: Some(now_ms.saturating_add(delay_ms)),
            last_error: Some(error.into()),
        }
    }

    /// Whether the retry budget of the tier is spent
    pub const fn is_exhausted(&self, policy: &TierPolicy) -> bool {
        self.retry_count > policy.max_retries
    }
}
