//! Conflict and resolution strategy models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{EntityKind, Snapshot};
use crate::error::Error;

/// Kind of divergence between two snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides changed the same record
    UpdateConflict,
}

/// Divergence between a local and a remote snapshot of the same record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict identifier
    pub id: Uuid,
    /// Table of the record
    pub entity: EntityKind,
    /// Record involved in the conflict
    pub record_id: String,
    /// Local snapshot at detection time
    pub local: Snapshot,
    /// Remote snapshot at detection time
    pub remote: Snapshot,
    /// Kind of divergence
    pub conflict_type: ConflictType,
    /// Detection timestamp (unix ms)
    pub detected_at: i64,
}

/// Rule deciding which snapshot becomes authoritative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    /// Local snapshot overwrites the remote one
    LocalWins,
    /// Remote snapshot overwrites the local one
    RemoteWins,
    /// Most recently modified snapshot wins
    TimestampWins,
    /// Entity-specific merge of both snapshots
    MergeData,
}

impl ResolutionRule {
    /// Stable name used in logs
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
            Self::TimestampWins => "timestamp_wins",
            Self::MergeData => "merge_data",
        }
    }
}

impl fmt::Display for ResolutionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "local_wins" => Ok(Self::LocalWins),
            "remote_wins" => Ok(Self::RemoteWins),
            "timestamp_wins" => Ok(Self::TimestampWins),
            "merge_data" => Ok(Self::MergeData),
            other => Err(Error::InvalidInput(format!(
                "unknown resolution rule: {other}"
            ))),
        }
    }
}

/// Per-entity resolution configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionStrategy {
    /// Rule to apply
    pub rule: ResolutionRule,
    /// Keep user-authored fields even when the rule would discard them
    #[serde(default)]
    pub preserve_user_data: bool,
}

impl ResolutionStrategy {
    /// Strategy with the given rule
    pub const fn new(rule: ResolutionRule, preserve_user_data: bool) -> Self {
        Self {
            rule,
            preserve_user_data,
        }
    }
}

impl Default for ResolutionStrategy {
    /// Used for any entity without an explicit entry
    fn default() -> Self {
        Self::new(ResolutionRule::TimestampWins, false)
    }
}

/// Which side a resolution kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionWinner {
    /// Local snapshot written to remote
    Local,
    /// Remote snapshot written locally
    Remote,
    /// Combined snapshot written to both sides
    Merged,
}

/// Outcome of a successful conflict resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Conflict that was resolved
    pub conflict_id: Uuid,
    /// Rule that was applied
    pub rule: ResolutionRule,
    /// Side that was kept
    pub winner: ResolutionWinner,
    /// Authoritative snapshot after resolution
    pub resolved: Snapshot,
    /// Human-readable summary
    pub description: String,
}
