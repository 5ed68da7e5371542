//! HTTP surface of the job runner.
//!
//! - `GET /queue_job/runjob` - Execute an enqueued job (used by HTTP dispatch)
//! - `POST /queue_job/enqueue`, `GET /queue_job/jobs` - Job management
//! - `GET /queue_job/channels` - Channel tree snapshot
//! - `GET /queue_job/events` - Real-time events (SSE streaming)

mod channels;
mod error;
mod init;
mod jobs;
mod realtime;

use std::sync::Arc;

use actors::{ActorRef, JobExecutor, RunnerMessage};
use axum::Router;
use axum::routing::{get, post};
use queue_core::JobEvent;
use tokio::sync::broadcast;

pub use channels::{channels, health};
pub use error::ApiError;
pub use init::{demo_handlers, init_job_runner};
pub use jobs::{
    EnqueueRequest, JobQuery, RequeueRequest, RunJobQuery, enqueue_job, get_job, list_jobs,
    requeue_jobs, run_job,
};
pub use realtime::events;

// Re-export core types for convenience
pub use queue_core::{Job, JobId, JobState, Priority};

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<JobExecutor>,
    /// Absent when this process only executes jobs another runner dispatches.
    pub runner: Option<ActorRef<RunnerMessage>>,
    pub events: broadcast::Sender<JobEvent>,
    /// Database this process serves.
    pub db_name: String,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/queue_job/runjob", get(run_job))
        .route("/queue_job/channels", get(channels))
        .route("/queue_job/enqueue", post(enqueue_job))
        .route("/queue_job/jobs", get(list_jobs))
        .route("/queue_job/jobs/{id}", get(get_job))
        .route("/queue_job/requeue", post(requeue_jobs))
        .route("/queue_job/events", get(events))
        .with_state(state)
}
