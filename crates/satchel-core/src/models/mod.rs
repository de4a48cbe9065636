//! Data models for Satchel

mod conflict;
mod entity;
mod operation;
mod status;

pub use conflict::{
    Conflict, ConflictType, Resolution, ResolutionRule, ResolutionStrategy, ResolutionWinner,
};
pub use entity::{
    attempt_is_final, snapshot_id, snapshot_updated_at, Column, ColumnKind, EntityKind, Snapshot,
};
pub use operation::{OperationId, OperationKind, QueuedOperation, SyncOperation, Tier};
pub use status::{ConnectivityStatus, SyncLogEntry, SyncLogStatus, SyncStatus};
