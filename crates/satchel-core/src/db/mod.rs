//! Database layer for Satchel

mod connection;
mod log_repository;
mod migrations;
mod queue_repository;
mod record_repository;
mod store;

pub use connection::Database;
pub use log_repository::{
    LibSqlSyncLogRepository, SyncLogRepository, LAST_FULL_SYNC_KEY, LAST_SYNC_KEY,
};
pub use queue_repository::{LibSqlQueueRepository, QueueRepository};
pub use record_repository::{
    json_value, read_snapshots, select_sql, sql_value, upsert_statement, LibSqlRecordRepository,
    RecordRepository,
};
pub use store::{LocalStore, Statement};
