//! Real-time event streaming via Server-Sent Events.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use queue_core::JobEvent;
use tokio::sync::broadcast::error::RecvError;

use crate::AppState;

/// Stream runner and job events as they happen.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.events.subscribe();

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((sse_event(&event), rx)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("event stream lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(event: &JobEvent) -> Result<Event, axum::Error> {
    let name = match event {
        JobEvent::RunnerReady { .. } => "runner_ready",
        JobEvent::RunnerStopped { .. } => "runner_stopped",
        JobEvent::JobDispatched { .. } => "job_dispatched",
        JobEvent::JobStarted { .. } => "job_started",
        JobEvent::JobDone { .. } => "job_done",
        JobEvent::JobFailed { .. } => "job_failed",
        JobEvent::JobRetrying { .. } => "job_retrying",
    };
    let sse = Event::default().event(name);
    let sse = match event.job_id() {
        Some(job_id) => sse.id(job_id.to_string()),
        None => sse,
    };
    sse.json_data(event)
}
