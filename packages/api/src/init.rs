//! Process initialization for the job runner.

use std::sync::Arc;
use std::time::Duration;

use actors::{
    JobExecutor, JobHandlerRegistry, RunnerConfig, RunnerHandle, job_handler, start_runner,
};
use db::DbConfig;
use queue_core::{JobError, as_datetime};
use tokio::sync::broadcast;

use crate::AppState;

/// Handlers shipped with the server, handy to try a deployment out.
pub fn demo_handlers() -> JobHandlerRegistry {
    let mut handlers = JobHandlerRegistry::new();

    // Demo: Echo handler
    handlers.register(job_handler!("demo.echo", |ctx| {
        tracing::info!("Echo job: {:?}", ctx.payload.args);
        Ok(Some(format!("echoed {} arguments", ctx.payload.args.len())))
    }));

    // Demo: Sleep handler
    handlers.register(job_handler!("demo.sleep", |ctx| {
        let seconds = ctx
            .payload
            .kwarg("seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(5);
        tracing::info!("Sleeping for {} seconds", seconds);
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        Ok(Some(format!("Slept for {} seconds", seconds)))
    }));

    // Demo: retries until the `until` datetime is reached
    handlers.register(job_handler!("demo.wait_until", |ctx| {
        let until = ctx
            .payload
            .kwarg("until")
            .ok_or_else(|| JobError::failed("missing until"))
            .and_then(|value| as_datetime(value).map_err(|e| JobError::from_error(&e)))?;
        if chrono::Utc::now() < until {
            return Err(JobError::retry_after("not yet", 10));
        }
        Ok(None)
    }));

    handlers
}

/// Connect the store and start the runner.
///
/// Without a runner configuration the process only executes jobs that
/// another runner dispatches to its `runjob` endpoint.
pub async fn init_job_runner(
    db_config: DbConfig,
    runner_config: Option<RunnerConfig>,
    handlers: JobHandlerRegistry,
) -> Result<(AppState, Option<RunnerHandle>), Box<dyn std::error::Error + Send + Sync>> {
    tracing::info!("Initializing job runner...");

    let db_name = db_config.database.clone();
    db::init(db_config).await?;

    match runner_config {
        Some(config) => {
            let runner = start_runner(config, handlers).await?;
            let state = AppState {
                executor: runner.executor.clone(),
                runner: Some(runner.runner.clone()),
                events: runner.events.clone(),
                db_name,
            };
            tracing::info!("Job runner initialized");
            Ok((state, Some(runner)))
        }
        None => {
            let (events, _) = broadcast::channel(1000);
            let executor = JobExecutor::new(Arc::new(handlers)).with_event_tx(events.clone());
            let state = AppState {
                executor: Arc::new(executor),
                runner: None,
                events,
                db_name,
            };
            tracing::info!("Job executor initialized, no runner in this process");
            Ok((state, None))
        }
    }
}
