//! Store schema definitions using SurrealQL.

use crate::{DbError, get_db};

/// Table holding one record per job.
pub const JOB_TABLE: &str = "queue_job";

/// Table holding named counters.
pub const SEQUENCE_TABLE: &str = "sequence";

/// Create tables and indexes. Safe to run on every start.
pub async fn init_schema() -> Result<(), DbError> {
    let db = get_db()?;

    tracing::info!("Initializing job store schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(SEQUENCE_SCHEMA).await?.check()?;

    tracing::info!("Job store schema initialized");

    Ok(())
}

/// Job table. Schemaless: dates are stored as RFC 3339 strings and
/// compared in Rust.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS queue_job SCHEMALESS;

-- Runner start-up and notifications read jobs by uuid and state
DEFINE INDEX IF NOT EXISTS queue_job_uuid ON queue_job FIELDS uuid UNIQUE;
DEFINE INDEX IF NOT EXISTS queue_job_state ON queue_job FIELDS state;
DEFINE INDEX IF NOT EXISTS queue_job_channel ON queue_job FIELDS channel;
DEFINE INDEX IF NOT EXISTS queue_job_identity ON queue_job FIELDS identity_key, state;
"#;

/// Counters used to allocate job sequence numbers.
const SEQUENCE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS sequence SCHEMALESS;
"#;
