//! Job runner binary: schedules stored jobs and serves the HTTP API.

mod config;

use std::error::Error;

use tracing_subscriber::EnvFilter;

use config::Settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    let (state, runner) =
        api::init_job_runner(settings.db, settings.runner, api::demo_handlers()).await?;

    let listener = tokio::net::TcpListener::bind(&settings.http_addr).await?;
    tracing::info!("listening on {}", settings.http_addr);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(runner) = runner {
        runner.stop().await;
    }
    tracing::info!("job runner stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("could not listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
