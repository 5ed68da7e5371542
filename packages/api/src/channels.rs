//! Runner status endpoints.

use axum::Json;
use axum::extract::State;
use db::repositories::JobRepository;
use queue_core::ChannelStatus;
use serde_json::{Value as JsonValue, json};

use crate::{ApiError, AppState};

/// Snapshot of the runner's channel tree.
pub async fn channels(State(state): State<AppState>) -> Result<Json<Vec<ChannelStatus>>, ApiError> {
    let runner = state
        .runner
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("No runner in this process".into()))?;
    Ok(Json(actors::channel_status(runner).await?))
}

pub async fn health(State(state): State<AppState>) -> Result<Json<JsonValue>, ApiError> {
    let counts = JobRepository::count_by_state().await?;
    let jobs: serde_json::Map<String, JsonValue> = counts
        .into_iter()
        .map(|(job_state, count)| (job_state.as_str().to_string(), json!(count)))
        .collect();

    Ok(Json(json!({
        "status": "ok",
        "db": state.db_name,
        "runner": state.runner.is_some(),
        "jobs": jobs,
    })))
}
