#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use std::sync::atomic::{AtomicUsize, Ordering};

use actors::{
    HandlerFuture, JobContext, JobExecutor, JobHandler, JobHandlerRegistry, JobOutcome,
    RunnerConfig, job_handler, start_runner,
};
use queue_core::JobEvent;
use db::repositories::JobRepository;
use queue_core::{Job, JobError, JobState, Priority};
use serde_json::json;

/// Asks for a retry until it has been called `succeed_after` times.
struct FlakyHandler {
    calls: Arc<AtomicUsize>,
    succeed_after: usize,
}

impl JobHandler for FlakyHandler {
    fn name(&self) -> &str {
        "flaky"
    }

    fn handle(&self, _ctx: JobContext) -> HandlerFuture {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let succeed_after = self.succeed_after;
        Box::pin(async move {
            if call < succeed_after {
                Err(JobError::retry_after("not yet", 0))
            } else {
                Ok(Some(format!("done after {} calls", call)))
            }
        })
    }
}

fn registry() -> JobHandlerRegistry {
    let mut handlers = JobHandlerRegistry::new();
    handlers.register(job_handler!("echo", |ctx| {
        Ok(Some(format!("echo {}", ctx.payload.args.len())))
    }));
    handlers.register(job_handler!("nothing", |_ctx| {
        Err(JobError::nothing_to_do("already synced"))
    }));
    handlers.register(job_handler!("broken", |_ctx| {
        Err(JobError::retry_after("remote down", 0))
    }));
    handlers
}

#[tokio::test]
async fn test_runner_executes_pending_jobs() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    // stored before the runner starts, picked up by the initial load
    let early = JobRepository::create(&Job::new("echo", json!([1, 2]))).await?;

    let runner = start_runner(RunnerConfig::new("main").with_channels("root:2"), registry()).await?;

    let late = JobRepository::create(&Job::new("echo", json!([1]))).await?;

    let early = common::wait_for_state(early.id, JobState::Done).await?;
    assert_eq!(early.state, JobState::Done);
    assert_eq!(early.result.as_deref(), Some("echo 2"));
    assert_eq!(early.retry, 1);
    assert!(early.date_done.is_some());

    let late = common::wait_for_state(late.id, JobState::Done).await?;
    assert_eq!(late.result.as_deref(), Some("echo 1"));

    let channels = runner.channels().await?;
    let root = channels
        .iter()
        .find(|c| c.name == "root")
        .ok_or("root channel missing")?;
    assert_eq!(root.capacity, Some(2));

    runner.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_retries_until_success() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let calls = Arc::new(AtomicUsize::new(0));
    let mut handlers = registry();
    handlers.register(FlakyHandler {
        calls: calls.clone(),
        succeed_after: 3,
    });
    let runner = start_runner(RunnerConfig::new("main"), handlers).await?;

    let job = JobRepository::create(&Job::new("flaky", json!([]))).await?;
    let job = common::wait_for_state(job.id, JobState::Done).await?;

    assert_eq!(job.state, JobState::Done);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(job.retry, 3);
    assert_eq!(job.result.as_deref(), Some("done after 3 calls"));

    runner.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_max_retries_fails_job() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let runner = start_runner(RunnerConfig::new("main"), registry()).await?;

    let job = JobRepository::create(&Job::new("broken", json!([])).with_max_retries(2)).await?;
    let job = common::wait_for_state(job.id, JobState::Failed).await?;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.retry, 2);
    assert_eq!(
        job.exc_info.as_deref(),
        Some("Max. retries (2) reached: remote down")
    );

    runner.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_function_is_rejected() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let runner = start_runner(RunnerConfig::new("main"), registry()).await?;

    let job = JobRepository::create(&Job::new("os.system", json!(["rm -rf /"]))).await?;
    let job = common::wait_for_state(job.id, JobState::Failed).await?;

    assert_eq!(job.state, JobState::Failed);
    assert!(job.exc_info.is_some_and(|info| info.contains("os.system")));

    runner.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_sequential_channel_keeps_order() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let mut ids = Vec::new();
    for n in 0..3 {
        let job = Job::new("echo", json!([n]))
            .with_channel("root.serial")
            .with_priority(Priority(10 - n));
        ids.push(JobRepository::create(&job).await?.id);
    }

    let runner = start_runner(
        RunnerConfig::new("main").with_channels("root:4,root.serial:1:sequential"),
        registry(),
    )
    .await?;

    let mut started = Vec::new();
    for id in &ids {
        let job = common::wait_for_state(*id, JobState::Done).await?;
        assert_eq!(job.state, JobState::Done);
        started.push((job.date_started, job.id));
    }
    started.sort();
    let order: Vec<_> = started.into_iter().map(|(_, id)| id).collect();

    // priority wins over creation order
    ids.reverse();
    assert_eq!(order, ids);

    runner.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_executor_skips_jobs_not_enqueued() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let executor = JobExecutor::new(Arc::new(registry()));
    let job = JobRepository::create(&Job::new("echo", json!([]))).await?;

    assert_eq!(executor.run_job(job.id).await?, JobOutcome::Skipped);
    assert_eq!(JobRepository::get(job.id).await?.state, JobState::Pending);

    JobRepository::set_enqueued(job.id, chrono::Utc::now()).await?;
    assert_eq!(executor.run_job(job.id).await?, JobOutcome::Done);

    let nothing = JobRepository::create(&Job::new("nothing", json!([]))).await?;
    JobRepository::set_enqueued(nothing.id, chrono::Utc::now()).await?;
    assert_eq!(executor.run_job(nothing.id).await?, JobOutcome::Done);
    let nothing = JobRepository::get(nothing.id).await?;
    assert_eq!(nothing.result.as_deref(), Some("already synced"));

    Ok(())
}

#[tokio::test]
async fn test_jobs_left_enqueued_run_after_restart() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    // enqueued by a runner that died before its worker got the job
    let stuck = JobRepository::create(&Job::new("echo", json!([1]))).await?;
    JobRepository::set_enqueued(stuck.id, chrono::Utc::now()).await?;
    let waiting = JobRepository::create(&Job::new("echo", json!([2]))).await?;

    let runner = start_runner(RunnerConfig::new("main"), registry()).await?;

    let stuck = common::wait_for_state(stuck.id, JobState::Done).await?;
    assert_eq!(stuck.state, JobState::Done);
    let waiting = common::wait_for_state(waiting.id, JobState::Done).await?;
    assert_eq!(waiting.state, JobState::Done);

    runner.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_runner_recovers_from_store_errors() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    // a record the runner cannot decode makes the initial load fail
    db::get_db()?
        .query("CREATE queue_job:broken SET state = 'pending', uuid = 42")
        .await?
        .check()?;
    let job = JobRepository::create(&Job::new("echo", json!([]))).await?;

    let runner = start_runner(RunnerConfig::new("main"), registry()).await?;
    let mut events = runner.subscribe();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(JobRepository::get(job.id).await?.state, JobState::Pending);
    db::get_db()?.query("DELETE queue_job:broken").await?.check()?;

    let ready = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(JobEvent::RunnerReady { jobs, .. }) => return Some(jobs),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await?;
    assert_eq!(ready, Some(1));

    let job = common::wait_for_state(job.id, JobState::Done).await?;
    assert_eq!(job.state, JobState::Done);

    runner.stop().await;
    Ok(())
}
