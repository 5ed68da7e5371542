//! Worker actor for executing jobs.

use std::sync::Arc;

use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::executor::JobExecutor;
use crate::messages::{RunnerMessage, WorkerMessage};

/// State for the worker actor.
pub struct WorkerActorState {
    /// Unique worker ID.
    pub worker_id: String,
    pub executor: Arc<JobExecutor>,
    /// Told about every finished job.
    pub runner: Option<ActorRef<RunnerMessage>>,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub executor: Arc<JobExecutor>,
    pub runner: Option<ActorRef<RunnerMessage>>,
}

/// Worker actor that executes jobs, one at a time.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!("Starting worker: {}", args.worker_id);

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            executor: args.executor,
            runner: args.runner,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::RunJob { job_id } => {
                let stored = match state.executor.run_job(job_id).await {
                    Ok(outcome) => {
                        tracing::debug!(
                            "worker {} finished job {}: {:?}",
                            state.worker_id,
                            job_id,
                            outcome
                        );
                        true
                    }
                    Err(err) => {
                        tracing::error!(
                            "worker {} could not run job {}: {}",
                            state.worker_id,
                            job_id,
                            err
                        );
                        false
                    }
                };

                if let Some(ref runner) = state.runner {
                    runner.send_message(RunnerMessage::JobFinished {
                        job_id,
                        worker_id: state.worker_id.clone(),
                        stored,
                    })?;
                }
            }

            WorkerMessage::Shutdown => {
                tracing::debug!("Shutting down worker: {}", state.worker_id);
                myself.stop(None);
            }
        }

        Ok(())
    }
}
