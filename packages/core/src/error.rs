//! Outcome classes of a job execution.

use thiserror::Error;

/// Delay before retrying a job that hit a storage serialization conflict (seconds).
pub const CONCURRENCY_RETRY_SECS: u64 = 5;

/// Errors a job function can return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Transient failure, the job is postponed and retried.
    #[error("{message}")]
    Retryable {
        message: String,
        /// Explicit delay, the retry pattern applies when absent.
        seconds: Option<u64>,
        /// Do not consume a retry credit.
        ignore_retry: bool,
    },

    /// Terminal failure.
    #[error("{0}")]
    Failed(String),

    /// Nothing to do, the job is considered done.
    #[error("{0}")]
    NothingToDo(String),

    /// Serialization conflict in storage.
    #[error("concurrent update: {0}")]
    Concurrency(String),

    /// The job no longer exists.
    #[error("job does not exist")]
    NoSuchJob,
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        JobError::Retryable {
            message: message.into(),
            seconds: None,
            ignore_retry: false,
        }
    }

    pub fn retry_after(message: impl Into<String>, seconds: u64) -> Self {
        JobError::Retryable {
            message: message.into(),
            seconds: Some(seconds),
            ignore_retry: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }

    pub fn nothing_to_do(message: impl Into<String>) -> Self {
        JobError::NothingToDo(message.into())
    }

    /// Build a failure carrying the whole source chain of `err`.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        JobError::Failed(error_chain(err))
    }
}

/// Render an error and its sources, one per line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str("\ncaused by: ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
