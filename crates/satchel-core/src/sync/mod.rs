//! Offline-first synchronization between the local store and the remote store.
//!
//! [`SyncCoordinator`] is the entry point. It maps triggers to strategies and
//! delegates to the [`RetryQueue`], [`ConflictResolver`] and
//! [`ConnectivityProber`].

mod conflict;
mod connectivity;
mod coordinator;
mod queue;
mod trigger;

pub use conflict::{ConflictResolver, DEFAULT_TOLERANCE_MS};
pub use connectivity::{
    ConnectionQuality, ConnectivityCallback, ConnectivityProber, NetworkInfo, ProbeKind,
    QualityReport, SubscriptionId,
};
pub use coordinator::{SyncCoordinator, SyncCoordinatorBuilder};
pub use queue::{QueueSummary, RetryQueue};
pub use trigger::{SyncOutcome, SyncReport, SyncTrigger, TriggerOptions};
