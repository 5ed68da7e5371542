//! Ways of getting an enqueued job executed.
//!
//! The runner either hands jobs to a pool of in-process worker actors, or
//! calls the `runjob` endpoint of an HTTP server that runs them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use queue_core::{ChannelJob, JobId};
use ractor::{Actor, ActorId, ActorRef};

use crate::executor::JobExecutor;
use crate::messages::{ActorError, ActorResult, RunnerMessage, WorkerMessage};
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// Default time to wait for the `runjob` endpoint to accept a request.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Fixed set of worker actors, each running one job at a time.
pub struct WorkerPool {
    workers: Vec<(String, ActorRef<WorkerMessage>)>,
    in_flight: Vec<usize>,
    assigned: HashMap<JobId, usize>,
    executor: Arc<JobExecutor>,
    runner: ActorRef<RunnerMessage>,
}

impl WorkerPool {
    /// Spawn `size` workers linked to the runner.
    pub async fn spawn(
        size: usize,
        executor: Arc<JobExecutor>,
        runner: ActorRef<RunnerMessage>,
    ) -> ActorResult<Self> {
        let size = size.max(1);
        let mut pool = Self {
            workers: Vec::with_capacity(size),
            in_flight: vec![0; size],
            assigned: HashMap::new(),
            executor,
            runner,
        };

        for index in 0..size {
            let worker_id = format!("worker-{}", index + 1);
            let worker = pool.spawn_worker(&worker_id).await?;
            pool.workers.push((worker_id, worker));
        }

        tracing::info!("started {} workers", size);
        Ok(pool)
    }

    async fn spawn_worker(&self, worker_id: &str) -> ActorResult<ActorRef<WorkerMessage>> {
        let args = WorkerArgs {
            worker_id: worker_id.to_string(),
            executor: self.executor.clone(),
            runner: Some(self.runner.clone()),
        };
        let (worker, _) = Actor::spawn_linked(None, WorkerActor, args, self.runner.get_cell())
            .await
            .map_err(|e| ActorError::Actor(format!("Failed to spawn worker: {}", e)))?;
        Ok(worker)
    }

    /// Give the job to the least busy worker.
    pub fn dispatch(&mut self, job_id: JobId) -> ActorResult<()> {
        let Some(index) = (0..self.workers.len()).min_by_key(|&i| self.in_flight[i]) else {
            return Err(ActorError::Dispatch("worker pool is empty".into()));
        };
        let (worker_id, worker) = &self.workers[index];

        worker
            .send_message(WorkerMessage::RunJob { job_id })
            .map_err(|e| ActorError::Dispatch(format!("{} unreachable: {}", worker_id, e)))?;

        self.in_flight[index] += 1;
        self.assigned.insert(job_id, index);
        Ok(())
    }

    /// Forget a job its worker reported finished.
    pub fn release(&mut self, job_id: JobId) {
        if let Some(index) = self.assigned.remove(&job_id) {
            self.in_flight[index] = self.in_flight[index].saturating_sub(1);
        }
    }

    /// Jobs handed out and not reported finished yet.
    pub fn assigned(&self) -> Vec<JobId> {
        self.assigned.keys().copied().collect()
    }

    /// Replace a dead worker.
    ///
    /// Returns the jobs the dead worker held, now released, or `None` when
    /// the actor was not one of ours.
    pub async fn respawn(&mut self, dead: ActorId) -> ActorResult<Option<Vec<JobId>>> {
        let Some(index) = self
            .workers
            .iter()
            .position(|(_, worker)| worker.get_id() == dead)
        else {
            return Ok(None);
        };

        let orphans: Vec<JobId> = self
            .assigned
            .iter()
            .filter(|&(_, &worker)| worker == index)
            .map(|(job_id, _)| *job_id)
            .collect();
        for job_id in &orphans {
            self.assigned.remove(job_id);
        }
        self.in_flight[index] = 0;

        let worker_id = self.workers[index].0.clone();
        let worker = self.spawn_worker(&worker_id).await?;
        tracing::warn!("respawned {}", worker_id);
        self.workers[index].1 = worker;
        Ok(Some(orphans))
    }

    pub fn shutdown(&self) {
        for (_, worker) in &self.workers {
            let _ = worker.send_message(WorkerMessage::Shutdown);
        }
    }
}

/// Fire-and-forget calls to `GET {base}/queue_job/runjob`.
#[derive(Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDispatcher {
    pub fn new(base_url: impl Into<String>) -> ActorResult<Self> {
        Self::with_timeout(base_url, DEFAULT_DISPATCH_TIMEOUT)
    }

    /// The timeout bounds the request, not the job: the server keeps
    /// running the job after the runner stops waiting.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> ActorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ActorError::Dispatch(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn runjob_url(&self) -> String {
        format!("{}/queue_job/runjob", self.base_url)
    }

    /// Ask the server to run the job. Returns as soon as the request is sent.
    pub fn dispatch(&self, job: &ChannelJob) {
        let request = self.client.get(self.runjob_url()).query(&[
            ("db", job.db_name.clone()),
            ("job_uuid", job.id.to_string()),
        ]);
        let job_id = job.id;

        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(
                        "runjob for job {} answered {}",
                        job_id,
                        response.status()
                    );
                }
                Ok(_) => {}
                Err(err) if err.is_timeout() => {
                    tracing::debug!("runjob for job {} still running", job_id);
                }
                Err(err) => {
                    tracing::error!("runjob for job {} failed: {}", job_id, err);
                }
            }
        });
    }
}

/// Where the runner sends the jobs it picked.
pub enum Dispatcher {
    Workers(WorkerPool),
    Http(HttpDispatcher),
}

impl Dispatcher {
    pub fn dispatch(&mut self, job: &ChannelJob) -> ActorResult<()> {
        match self {
            Dispatcher::Workers(pool) => pool.dispatch(job.id),
            Dispatcher::Http(http) => {
                http.dispatch(job);
                Ok(())
            }
        }
    }

    pub fn release(&mut self, job_id: JobId) {
        if let Dispatcher::Workers(pool) = self {
            pool.release(job_id);
        }
    }

    /// Jobs running in this process. Nothing is known of HTTP dispatched jobs.
    pub fn assigned(&self) -> Vec<JobId> {
        match self {
            Dispatcher::Workers(pool) => pool.assigned(),
            Dispatcher::Http(_) => Vec::new(),
        }
    }

    pub fn shutdown(&self) {
        if let Dispatcher::Workers(pool) = self {
            pool.shutdown();
        }
    }
}
