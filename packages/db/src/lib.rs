//! SurrealDB-backed job store.
//!
//! This crate provides the connection, the `queue_job` table and the
//! repository used by the runner and the executor. Table changes are
//! published through a live query, which wakes the runner up.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, get_db, init_db};
pub use schema::{JOB_TABLE, init_schema};

/// Initialize the store with the given configuration.
///
/// This should be called once at application startup.
pub async fn init(config: DbConfig) -> Result<(), DbError> {
    init_db(config).await?;
    init_schema().await?;
    Ok(())
}
