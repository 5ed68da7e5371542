//! Connection to the job store, initialized once per process.

use std::sync::LazyLock;
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Global store handle, set by [`init_db`].
static DB: LazyLock<OnceCell<Database>> = LazyLock::new(OnceCell::new);

/// Database connection wrapper.
pub type Database = Surreal<Any>;

/// Where and how to reach the job store.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Engine endpoint: `mem://`, `file://path` or `rocksdb://path`.
    pub endpoint: String,
    pub namespace: String,
    /// Database name. Jobs scheduled by the runner are tagged with it.
    pub database: String,
    /// Optional root credentials
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "queue_job".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// In-memory store, for tests and local runs.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Parse an endpoint given on the command line or in the environment.
    ///
    /// `memory` is accepted as a shorthand for `mem://`.
    pub fn from_endpoint(endpoint: &str) -> Self {
        match endpoint {
            "" | "memory" | "mem://" => Self::memory(),
            other => Self {
                endpoint: other.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("file://{}", path.into()),
            ..Default::default()
        }
    }

    /// RocksDB persistence (requires the `rocksdb` feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

/// Store errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database not initialized - call init_db first")]
    NotInitialized,
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Concurrent update: {0}")]
    Conflict(String),
}

impl DbError {
    /// Whether the error is a transaction conflict worth retrying later.
    pub fn is_concurrency_error(&self) -> bool {
        match self {
            DbError::Conflict(_) => true,
            DbError::Connection(err) => {
                let message = err.to_string();
                message.contains("read or write conflict") || message.contains("can be retried")
            }
            _ => false,
        }
    }
}

/// Connect to the store. Later calls return the first connection.
pub async fn init_db(config: DbConfig) -> Result<&'static Database, DbError> {
    let connection = DB
        .get_or_try_init(|| async {
            tracing::info!("Connecting to job store: {}", config.endpoint);

            let db = connect(&config.endpoint).await?;

            if let Some((username, password)) = &config.credentials {
                db.signin(Root { username, password }).await?;
            }

            db.use_ns(&config.namespace).use_db(&config.database).await?;

            tracing::info!(
                "Connected to job store: {}/{}",
                config.namespace,
                config.database
            );

            Ok::<_, DbError>(db)
        })
        .await?;
    Ok(connection)
}

pub fn get_db() -> Result<&'static Database, DbError> {
    DB.get().ok_or(DbError::NotInitialized)
}
