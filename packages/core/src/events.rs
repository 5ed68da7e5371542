//! Event types for real-time updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Events emitted by the runner and the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// The runner loaded the jobs of a database and is scheduling them.
    RunnerReady {
        db_name: String,
        jobs: usize,
        timestamp: DateTime<Utc>,
    },
    /// The runner stopped.
    RunnerStopped { timestamp: DateTime<Utc> },

    /// The runner handed a job to a worker.
    JobDispatched {
        job_id: JobId,
        channel: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker started executing a job.
    JobStarted {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// A job finished.
    JobDone {
        job_id: JobId,
        result: Option<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job failed terminally.
    JobFailed {
        job_id: JobId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A job was postponed for another attempt.
    JobRetrying {
        job_id: JobId,
        retry: u32,
        eta: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::RunnerReady { timestamp, .. }
            | JobEvent::RunnerStopped { timestamp }
            | JobEvent::JobDispatched { timestamp, .. }
            | JobEvent::JobStarted { timestamp, .. }
            | JobEvent::JobDone { timestamp, .. }
            | JobEvent::JobFailed { timestamp, .. }
            | JobEvent::JobRetrying { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobDispatched { job_id, .. }
            | JobEvent::JobStarted { job_id, .. }
            | JobEvent::JobDone { job_id, .. }
            | JobEvent::JobFailed { job_id, .. }
            | JobEvent::JobRetrying { job_id, .. } => Some(*job_id),
            JobEvent::RunnerReady { .. } | JobEvent::RunnerStopped { .. } => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::RunnerReady { db_name, jobs, .. } => {
                format!("Runner ready for db {} ({} jobs)", db_name, jobs)
            }
            JobEvent::RunnerStopped { .. } => "Runner stopped".to_string(),
            JobEvent::JobDispatched {
                job_id, channel, ..
            } => format!("Job {} dispatched from {}", job_id, channel),
            JobEvent::JobStarted { job_id, .. } => format!("Job {} started", job_id),
            JobEvent::JobDone {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} done in {}ms", job_id, duration_ms),
            JobEvent::JobFailed { job_id, error, .. } => {
                format!("Job {} failed: {}", job_id, error)
            }
            JobEvent::JobRetrying { job_id, retry, .. } => {
                format!("Job {} postponed (retry {})", job_id, retry)
            }
        }
    }
}
