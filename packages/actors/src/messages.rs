//! Message types for actor communication.

use db::DbError;
use db::repositories::JobChange;
use queue_core::{ChannelError, ChannelStatus, JobId};
use ractor::RpcReplyPort;

/// Messages for the RunnerActor.
#[derive(Debug)]
pub enum RunnerMessage {
    /// Load the jobs from the store and start listening to changes.
    Initialize,

    /// A job changed in the store.
    Notify { change: JobChange },

    /// A worker is done with a job, whatever the outcome.
    ///
    /// `stored` is false when the outcome could not be written, leaving the
    /// job enqueued or started in the store.
    JobFinished {
        job_id: JobId,
        worker_id: String,
        stored: bool,
    },

    /// Look for runnable jobs again (ETA reached, throttle over, periodic poll).
    Wakeup,

    /// Delete old done jobs.
    Vacuum,

    /// Snapshot of the channel tree.
    GetChannels {
        reply: RpcReplyPort<Vec<ChannelStatus>>,
    },

    /// Stop the runner and its workers.
    Stop,
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Execute an enqueued job.
    RunJob { job_id: JobId },

    /// Shutdown the worker.
    Shutdown,
}

/// Result type for internal operations.
pub type ActorResult<T> = Result<T, ActorError>;

/// Error type for actor operations.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Actor error: {0}")]
    Actor(String),
}
