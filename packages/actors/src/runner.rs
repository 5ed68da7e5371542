//! The runner actor: owns the channel tree and decides what runs next.
//!
//! It loads every unfinished job at start, then follows the job table
//! through a live query. Each change is fed to the [`ChannelManager`], after
//! which the jobs the channels admit are marked enqueued and dispatched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::DbError;
use db::repositories::{JobChange, JobRepository};
use futures_util::StreamExt;
use queue_core::{ChannelManager, ChannelStatus, JobEvent};
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::dispatch::{Dispatcher, HttpDispatcher, WorkerPool};
use crate::executor::JobExecutor;
use crate::handler::JobHandlerRegistry;
use crate::messages::{ActorError, ActorResult, RunnerMessage};

/// Longest the runner sleeps without looking at the channels.
pub const SELECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause before reconnecting after a storage error.
pub const ERROR_RECOVERY_DELAY: Duration = Duration::from_secs(5);

/// Worker count when the root channel is unbounded.
const DEFAULT_WORKERS: usize = 4;

/// Floor for wakeup timers, so a due wakeup does not spin.
const MIN_WAKEUP_DELAY: Duration = Duration::from_millis(10);

/// How the runner gets jobs executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchMode {
    /// In-process worker actors.
    Workers,
    /// `GET {base_url}/queue_job/runjob` on a job server.
    Http { base_url: String },
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Channel configuration string, e.g. `root:4,root.mail:1:throttle=2`.
    pub channels: String,
    /// Database the jobs belong to.
    pub db_name: String,
    /// Worker count, defaults to the root channel capacity.
    pub workers: Option<usize>,
    pub dispatch: DispatchMode,
    /// Done jobs older than this are deleted periodically.
    pub keep_done: Option<chrono::Duration>,
    pub vacuum_interval: Duration,
}

impl RunnerConfig {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            channels: "root:1".to_string(),
            db_name: db_name.into(),
            workers: None,
            dispatch: DispatchMode::Workers,
            keep_done: None,
            vacuum_interval: Duration::from_secs(3600),
        }
    }

    pub fn with_channels(mut self, channels: impl Into<String>) -> Self {
        self.channels = channels.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_keep_done(mut self, keep: chrono::Duration) -> Self {
        self.keep_done = Some(keep);
        self
    }
}

/// State for the runner actor.
pub struct RunnerState {
    config: RunnerConfig,
    manager: ChannelManager,
    dispatcher: Dispatcher,
    event_tx: broadcast::Sender<JobEvent>,
    /// Set once the jobs are loaded and the listener is up.
    ready: bool,
    listener: Option<JoinHandle<()>>,
    wakeup: Option<JoinHandle<()>>,
    vacuum: Option<JoinHandle<()>>,
}

impl RunnerState {
    fn emit(&self, event: JobEvent) {
        tracing::trace!("{}", event.description());
        let _ = self.event_tx.send(event);
    }

    fn abort_tasks(&mut self) {
        for task in [
            self.listener.take(),
            self.wakeup.take(),
            self.vacuum.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

/// Runner actor arguments.
pub struct RunnerArgs {
    pub config: RunnerConfig,
    pub executor: Arc<JobExecutor>,
    pub event_tx: broadcast::Sender<JobEvent>,
}

/// Runner actor.
pub struct RunnerActor;

impl Actor for RunnerActor {
    type Msg = RunnerMessage;
    type State = RunnerState;
    type Arguments = RunnerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let RunnerArgs {
            config,
            executor,
            event_tx,
        } = args;

        let mut manager = ChannelManager::new();
        manager.simple_configure(&config.channels)?;

        let dispatcher = match &config.dispatch {
            DispatchMode::Workers => {
                let size = config.workers.unwrap_or_else(|| match manager.root().capacity {
                    Some(capacity) => capacity as usize,
                    None => DEFAULT_WORKERS,
                });
                Dispatcher::Workers(WorkerPool::spawn(size, executor, myself.clone()).await?)
            }
            DispatchMode::Http { base_url } => {
                tracing::info!("dispatching jobs to {}", base_url);
                Dispatcher::Http(HttpDispatcher::new(base_url.clone())?)
            }
        };

        for channel in manager.channels() {
            tracing::info!("configured channel {}", channel);
        }

        Ok(RunnerState {
            config,
            manager,
            dispatcher,
            event_tx,
            ready: false,
            listener: None,
            wakeup: None,
            vacuum: None,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if state.config.keep_done.is_some() {
            let myself_clone = myself.clone();
            let period = state.config.vacuum_interval;
            state.vacuum = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    if myself_clone.send_message(RunnerMessage::Vacuum).is_err() {
                        break;
                    }
                }
            }));
        }

        myself.send_message(RunnerMessage::Initialize)?;
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.abort_tasks();
        state.dispatcher.shutdown();
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            RunnerMessage::Initialize => {
                if let Err(err) = initialize(&myself, state).await {
                    recover(&myself, state, err);
                }
            }

            RunnerMessage::Notify { change } => {
                // jobs changed before initialization are read by the initial load
                if !state.ready {
                    return Ok(());
                }
                let result = match notify(state, change).await {
                    Ok(()) => run_jobs(&myself, state).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    recover(&myself, state, err);
                }
            }

            RunnerMessage::JobFinished {
                job_id,
                worker_id,
                stored,
            } => {
                tracing::debug!("{} released job {}", worker_id, job_id);
                state.dispatcher.release(job_id);
                if !stored && let Err(err) = JobRepository::reset_pending(job_id).await {
                    recover(&myself, state, err);
                }
            }

            RunnerMessage::Wakeup => {
                if state.ready
                    && let Err(err) = run_jobs(&myself, state).await
                {
                    recover(&myself, state, err);
                }
            }

            RunnerMessage::Vacuum => {
                if let Some(keep) = state.config.keep_done
                    && let Err(err) = JobRepository::vacuum_done(keep, Utc::now()).await
                {
                    tracing::warn!("could not vacuum done jobs: {}", err);
                }
            }

            RunnerMessage::GetChannels { reply } => {
                let _ = reply.send(state.manager.status());
            }

            RunnerMessage::Stop => {
                tracing::info!("stopping runner for db {}", state.config.db_name);
                state.emit(JobEvent::RunnerStopped {
                    timestamp: Utc::now(),
                });
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                tracing::debug!("worker {:?} terminated: {:?}", cell.get_id(), reason);
            }
            SupervisionEvent::ActorFailed(cell, err) => {
                tracing::error!("worker {:?} failed: {}", cell.get_id(), err);
                let Dispatcher::Workers(pool) = &mut state.dispatcher else {
                    return Ok(());
                };
                let Some(orphans) = pool.respawn(cell.get_id()).await? else {
                    return Ok(());
                };
                for job_id in orphans {
                    if let Err(err) = JobRepository::reset_pending(job_id).await {
                        recover(&myself, state, err);
                        break;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Subscribe to job changes, then load every unfinished job.
async fn initialize(
    myself: &ActorRef<RunnerMessage>,
    state: &mut RunnerState,
) -> Result<(), DbError> {
    if let Some(task) = state.listener.take() {
        task.abort();
    }
    state.ready = false;
    state.manager.remove_db(&state.config.db_name);

    let mut changes = JobRepository::listen().await?;
    let myself_clone = myself.clone();
    state.listener = Some(tokio::spawn(async move {
        while let Some(change) = changes.next().await {
            if myself_clone
                .send_message(RunnerMessage::Notify { change })
                .is_err()
            {
                return;
            }
        }
        tracing::warn!("job change stream ended");
        let _ = myself_clone.send_message(RunnerMessage::Initialize);
    }));

    // nothing else runs jobs for in-process workers
    if matches!(state.dispatcher, Dispatcher::Workers(_)) {
        JobRepository::requeue_orphans(&state.dispatcher.assigned()).await?;
    }

    let jobs = JobRepository::select_not_done().await?;
    let count = jobs.len();
    for job in jobs {
        state.manager.notify(job.channel_job(&state.config.db_name));
    }
    state.ready = true;

    tracing::info!(
        "queue job runner ready for db {} with {} jobs",
        state.config.db_name,
        count
    );
    state.emit(JobEvent::RunnerReady {
        db_name: state.config.db_name.clone(),
        jobs: count,
        timestamp: Utc::now(),
    });

    run_jobs(myself, state).await
}

/// Re-read a changed job and tell the channels about it.
async fn notify(state: &mut RunnerState, change: JobChange) -> Result<(), DbError> {
    if change.removed {
        state.manager.remove_job(change.id);
        return Ok(());
    }
    match JobRepository::find(change.id).await? {
        Some(job) => state.manager.notify(job.channel_job(&state.config.db_name)),
        None => {
            state.manager.remove_job(change.id);
        }
    }
    Ok(())
}

/// Enqueue and dispatch what the channels admit, then arm the next wakeup.
async fn run_jobs(
    myself: &ActorRef<RunnerMessage>,
    state: &mut RunnerState,
) -> Result<(), DbError> {
    let now = Utc::now();

    for job in state.manager.get_jobs_to_run(now) {
        match JobRepository::set_enqueued(job.id, now).await {
            Ok(_) => {}
            Err(DbError::NotFound(_)) => {
                tracing::warn!("job {} vanished before it was enqueued", job.id);
                state.manager.remove_job(job.id);
                continue;
            }
            Err(err) => return Err(err),
        }

        let channel = state.manager.channel(job.channel).full_name().to_string();
        tracing::info!(
            "asking worker to run job {} on db {} (channel {})",
            job.id,
            job.db_name,
            channel
        );
        if let Err(err) = state.dispatcher.dispatch(&job) {
            tracing::error!("could not dispatch job {}, back to pending: {}", job.id, err);
            state.dispatcher.release(job.id);
            JobRepository::reset_pending(job.id).await?;
            continue;
        }
        state.emit(JobEvent::JobDispatched {
            job_id: job.id,
            channel,
            timestamp: now,
        });
    }

    schedule_wakeup(myself, state);
    Ok(())
}

fn schedule_wakeup(myself: &ActorRef<RunnerMessage>, state: &mut RunnerState) {
    let now = Utc::now();
    let deadline = now
        + chrono::Duration::from_std(SELECT_TIMEOUT).unwrap_or_else(|_| chrono::Duration::zero());
    let wakeup = state
        .manager
        .get_wakeup_time()
        .map_or(deadline, |time| time.min(deadline));
    let delay = (wakeup - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(MIN_WAKEUP_DELAY);

    if let Some(task) = state.wakeup.take() {
        task.abort();
    }
    let myself_clone = myself.clone();
    state.wakeup = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = myself_clone.send_message(RunnerMessage::Wakeup);
    }));
}

/// Drop what the runner knows about the database and start over later.
fn recover(myself: &ActorRef<RunnerMessage>, state: &mut RunnerState, err: DbError) {
    tracing::error!(
        "job store error: {}, sleeping {}s and retrying",
        err,
        ERROR_RECOVERY_DELAY.as_secs()
    );
    state.ready = false;
    if let Some(task) = state.listener.take() {
        task.abort();
    }
    if let Some(task) = state.wakeup.take() {
        task.abort();
    }
    state.manager.remove_db(&state.config.db_name);

    let myself_clone = myself.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ERROR_RECOVERY_DELAY).await;
        let _ = myself_clone.send_message(RunnerMessage::Initialize);
    });
}

/// A running runner and the pieces callers talk to.
pub struct RunnerHandle {
    pub runner: ActorRef<RunnerMessage>,
    pub join: JoinHandle<()>,
    pub executor: Arc<JobExecutor>,
    pub events: broadcast::Sender<JobEvent>,
}

impl RunnerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the channel tree.
    pub async fn channels(&self) -> ActorResult<Vec<ChannelStatus>> {
        channel_status(&self.runner).await
    }

    /// Stop the runner and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.runner.send_message(RunnerMessage::Stop);
        let _ = self.join.await;
    }
}

/// Ask a runner for its channel tree.
pub async fn channel_status(runner: &ActorRef<RunnerMessage>) -> ActorResult<Vec<ChannelStatus>> {
    let (tx, rx) = ractor::concurrency::oneshot();
    runner
        .send_message(RunnerMessage::GetChannels { reply: tx.into() })
        .map_err(|e| ActorError::Actor(format!("runner unreachable: {}", e)))?;
    rx.await
        .map_err(|e| ActorError::Actor(format!("runner did not answer: {}", e)))
}

/// Start a runner with its executor and event channel.
pub async fn start_runner(
    config: RunnerConfig,
    handlers: JobHandlerRegistry,
) -> ActorResult<RunnerHandle> {
    let (events, _) = broadcast::channel(1000);
    let executor = Arc::new(JobExecutor::new(Arc::new(handlers)).with_event_tx(events.clone()));

    let args = RunnerArgs {
        config,
        executor: executor.clone(),
        event_tx: events.clone(),
    };
    let (runner, join) = Actor::spawn(None, RunnerActor, args)
        .await
        .map_err(|e| ActorError::Actor(format!("Failed to spawn runner: {}", e)))?;

    Ok(RunnerHandle {
        runner,
        join,
        executor,
        events,
    })
}
