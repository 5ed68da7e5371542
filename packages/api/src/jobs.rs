//! Job endpoints.

use actors::JobOutcome;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use db::repositories::{JobFilter, JobRepository};
use queue_core::{Job, JobId, JobState, MAX_DELAY_SECS, Priority, RetryPattern};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::{ApiError, AppState};

/// Query of `GET /queue_job/runjob`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunJobQuery {
    pub db: String,
    pub job_uuid: String,
}

/// Execute an enqueued job in this process.
///
/// Answers once the job is over. Jobs that are not enqueued are skipped.
/// The job runs on its own task: a caller that stops waiting does not
/// cancel it.
pub async fn run_job(
    State(state): State<AppState>,
    Query(query): Query<RunJobQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    if query.db != state.db_name {
        return Err(ApiError::BadRequest(format!("Unknown database: {}", query.db)));
    }
    let job_id = parse_job_id(&query.job_uuid)?;

    tracing::debug!("runjob {} on db {}", job_id, query.db);
    let executor = state.executor.clone();
    let outcome = tokio::spawn(async move { executor.run_job(job_id).await })
        .await
        .map_err(|e| ApiError::Internal(format!("job {} aborted: {}", job_id, e)))??;

    let outcome = match outcome {
        JobOutcome::Done => "done",
        JobOutcome::Retrying { .. } => "retrying",
        JobOutcome::Failed => "failed",
        JobOutcome::Skipped => "skipped",
    };
    Ok(Json(json!({ "job_uuid": job_id, "outcome": outcome })))
}

/// Request type for creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub func: String,
    #[serde(default)]
    pub args: JsonValue,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_pattern: Option<Vec<(u32, u64)>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub identity_key: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Store a new job. Only registered functions are accepted.
pub async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let mut job = state
        .executor
        .handlers()
        .new_job(&request.func, request.args)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown function: {}", request.func)))?;

    if let Some(channel) = request.channel {
        job = job.with_channel(channel);
    }
    if let Some(priority) = request.priority {
        job = job.with_priority(Priority(priority));
    }
    if let Some(eta) = request.eta {
        job = job.with_eta(eta);
    }
    if let Some(max_retries) = request.max_retries {
        job = job.with_max_retries(max_retries);
    }
    if let Some(pattern) = request.retry_pattern {
        let pattern = RetryPattern::new(pattern);
        if pattern.max_seconds() > MAX_DELAY_SECS {
            return Err(ApiError::BadRequest(format!(
                "Retry delays are limited to {} seconds",
                MAX_DELAY_SECS
            )));
        }
        job = job.with_retry_pattern(pattern);
    }
    if let Some(description) = request.description {
        job = job.with_description(description);
    }
    if let Some(key) = request.identity_key {
        job = job.with_identity_key(key);
    }
    if let Some(timeout) = request.timeout_secs {
        job = job.with_timeout(timeout);
    }

    let job = JobRepository::create(&job).await?;
    tracing::info!("enqueued job {} ({}) in channel {}", job.id, job.func, job.channel);

    Ok((StatusCode::CREATED, Json(job)))
}

/// Query of `GET /queue_job/jobs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobQuery {
    pub state: Option<JobState>,
    pub channel: Option<String>,
    pub func: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// List jobs in scheduling order.
pub async fn list_jobs(Query(query): Query<JobQuery>) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = JobRepository::list(JobFilter {
        state: query.state,
        channel: query.channel,
        func: query.func,
        limit: query.limit,
        offset: query.offset,
    })
    .await?;
    Ok(Json(jobs))
}

/// Get a job by ID.
pub async fn get_job(Path(id): Path<String>) -> Result<Json<Job>, ApiError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(JobRepository::get(job_id).await?))
}

/// Request type for requeuing failed jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequeueRequest {
    pub ids: Vec<String>,
}

/// Put failed jobs back in the queue.
pub async fn requeue_jobs(
    Json(request): Json<RequeueRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let ids = request
        .ids
        .iter()
        .map(|id| parse_job_id(id))
        .collect::<Result<Vec<_>, _>>()?;
    let requeued = JobRepository::requeue(&ids).await?;
    Ok(Json(json!({ "requeued": requeued })))
}

fn parse_job_id(id: &str) -> Result<JobId, ApiError> {
    JobId::parse(id).map_err(|e| ApiError::BadRequest(format!("Invalid job ID: {}", e)))
}
