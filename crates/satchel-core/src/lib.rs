//! satchel-core - Offline-first sync engine for Satchel
//!
//! This crate contains the local store, the remote store abstraction and the
//! sync subsystem (coordinator, retry queue, conflict resolver and
//! connectivity prober) used by the Satchel CLI and embedding applications.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod seed;
pub mod sync;
pub mod util;

pub use config::SatchelConfig;
pub use db::LocalStore;
pub use error::{Error, Result};
pub use models::{EntityKind, Snapshot, SyncOperation, SyncStatus, Tier};
pub use remote::{LibSqlRemoteStore, MemoryRemoteStore, RemoteStore};
pub use sync::{SyncCoordinator, SyncOutcome, SyncReport, SyncTrigger, TriggerOptions};
