//! Executes one enqueued job and records its outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use db::DbError;
use db::repositories::JobRepository;
use futures_util::FutureExt;
use queue_core::{
    CONCURRENCY_RETRY_SECS, Job, JobError, JobEvent, JobId, JobPayload, JobState, Whitelist,
    error_chain,
};
use tokio::sync::broadcast;

use crate::handler::{JobContext, JobHandlerRegistry};
use crate::messages::ActorResult;

/// What happened to a job handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job is done.
    Done,
    /// The job went back to pending with a new ETA.
    Retrying { eta: Option<DateTime<Utc>> },
    /// The job failed and waits for a manual requeue.
    Failed,
    /// The job was not run: missing, or not in the enqueued state.
    Skipped,
}

/// Runs jobs against the registered handlers.
pub struct JobExecutor {
    handlers: Arc<JobHandlerRegistry>,
    whitelist: Whitelist,
    event_tx: Option<broadcast::Sender<JobEvent>>,
}

impl JobExecutor {
    pub fn new(handlers: Arc<JobHandlerRegistry>) -> Self {
        let whitelist = handlers.whitelist();
        Self {
            handlers,
            whitelist,
            event_tx: None,
        }
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<JobEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn handlers(&self) -> &JobHandlerRegistry {
        &self.handlers
    }

    /// Run a job the runner marked enqueued.
    ///
    /// Jobs in any other state are left untouched. A write conflict on the
    /// job record postpones it without consuming a retry.
    pub async fn run_job(&self, id: JobId) -> ActorResult<JobOutcome> {
        let Some(mut job) = JobRepository::find(id).await? else {
            tracing::warn!("job {} does not exist, skipping", id);
            return Ok(JobOutcome::Skipped);
        };
        if job.state != JobState::Enqueued {
            tracing::warn!(
                "job {} is in state {} instead of enqueued, skipping",
                id,
                job.state
            );
            return Ok(JobOutcome::Skipped);
        }

        job.set_started(Utc::now());
        let mut job = match JobRepository::update(&job).await {
            Ok(job) => job,
            Err(err) if err.is_concurrency_error() => {
                return self.retry_postpone(id, &err).await;
            }
            Err(err) => return Err(err.into()),
        };
        self.emit(JobEvent::JobStarted {
            job_id: id,
            timestamp: Utc::now(),
        });

        tracing::debug!("running job {} ({})", id, job.func);
        let started = Instant::now();
        let result = self.perform(&mut job).await;
        let outcome = self.apply(&mut job, result, started.elapsed());

        match JobRepository::update(&job).await {
            Ok(_) => Ok(outcome),
            Err(err) if err.is_concurrency_error() => self.retry_postpone(id, &err).await,
            Err(err) => Err(err.into()),
        }
    }

    /// Call the handler and turn exhausted retries into a failure.
    async fn perform(&self, job: &mut Job) -> Result<Option<String>, JobError> {
        job.retry += 1;

        let payload = JobPayload::from_job_args(&job.func, &job.args);
        payload
            .check(&self.whitelist)
            .map_err(|err| JobError::failed(error_chain(&err)))?;
        let handler = self
            .handlers
            .get(&job.func)
            .ok_or_else(|| JobError::failed(format!("No handler for function: {}", job.func)))?;

        let ctx = JobContext {
            job: job.clone(),
            payload,
        };
        let timeout = Duration::from_secs(job.timeout_secs);
        let handled = AssertUnwindSafe(handler.handle(ctx)).catch_unwind();
        let result = match tokio::time::timeout(timeout, handled).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(JobError::failed(format!(
                "Job panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(JobError::retryable("Job timed out")),
        };

        match result {
            Err(JobError::Retryable {
                ignore_retry: true, ..
            })
            | Err(JobError::Concurrency(_)) => {
                job.retry = job.retry.saturating_sub(1);
                result
            }
            Err(JobError::Retryable { message, .. }) if job.is_retry_exhausted() => {
                Err(JobError::failed(format!(
                    "Max. retries ({}) reached: {}",
                    job.max_retries, message
                )))
            }
            other => other,
        }
    }

    fn apply(
        &self,
        job: &mut Job,
        result: Result<Option<String>, JobError>,
        elapsed: Duration,
    ) -> JobOutcome {
        let now = Utc::now();
        match result {
            Ok(result) => {
                job.set_done(result.clone(), now);
                self.emit(JobEvent::JobDone {
                    job_id: job.id,
                    result,
                    duration_ms: elapsed.as_millis() as u64,
                    timestamp: now,
                });
                JobOutcome::Done
            }
            Err(JobError::NothingToDo(message)) => {
                tracing::info!("job {}: {}", job.id, message);
                job.set_done(Some(message.clone()), now);
                self.emit(JobEvent::JobDone {
                    job_id: job.id,
                    result: Some(message),
                    duration_ms: elapsed.as_millis() as u64,
                    timestamp: now,
                });
                JobOutcome::Done
            }
            Err(JobError::Retryable {
                message, seconds, ..
            }) => {
                tracing::info!("job {} postponed: {}", job.id, message);
                job.postpone(Some(message), seconds, now);
                job.set_pending(None, false);
                self.retrying(job, now)
            }
            Err(JobError::Concurrency(message)) => {
                tracing::info!("job {} postponed after a conflict: {}", job.id, message);
                job.postpone(Some(message), Some(CONCURRENCY_RETRY_SECS), now);
                job.set_pending(None, false);
                self.retrying(job, now)
            }
            Err(JobError::Failed(message)) => {
                tracing::error!("job {} failed: {}", job.id, message);
                job.set_failed(message.clone());
                self.emit(JobEvent::JobFailed {
                    job_id: job.id,
                    error: message,
                    timestamp: now,
                });
                JobOutcome::Failed
            }
            Err(JobError::NoSuchJob) => {
                tracing::warn!("job {} vanished while running", job.id);
                JobOutcome::Skipped
            }
        }
    }

    fn retrying(&self, job: &Job, now: DateTime<Utc>) -> JobOutcome {
        self.emit(JobEvent::JobRetrying {
            job_id: job.id,
            retry: job.retry,
            eta: job.eta,
            timestamp: now,
        });
        JobOutcome::Retrying { eta: job.eta }
    }

    /// Another writer touched the job: reload it and try again shortly.
    async fn retry_postpone(&self, id: JobId, err: &DbError) -> ActorResult<JobOutcome> {
        tracing::info!("job {} hit a concurrent update, retrying later: {}", id, err);
        let Some(mut job) = JobRepository::find(id).await? else {
            return Ok(JobOutcome::Skipped);
        };
        let now = Utc::now();
        job.postpone(Some(err.to_string()), Some(CONCURRENCY_RETRY_SECS), now);
        job.set_pending(None, false);
        JobRepository::update(&job).await?;
        Ok(self.retrying(&job, now))
    }

    fn emit(&self, event: JobEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
