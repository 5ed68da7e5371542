//! Actor system for the job runner.
//!
//! This crate provides the Ractor-based runner that schedules stored jobs
//! through the channel tree, and the executor that runs them.
//!
//! # Architecture
//!
//! - `RunnerActor` - Follows the job table and dispatches runnable jobs
//! - `WorkerActor` - Executes the jobs the runner hands it
//! - `JobExecutor` - Runs one job and stores its outcome
//!
//! # Usage
//!
//! ```ignore
//! use actors::{JobHandlerRegistry, RunnerConfig, start_runner};
//!
//! let mut handlers = JobHandlerRegistry::new();
//! handlers.register(job_handler!("mail.send", |ctx| { Ok(None) }));
//!
//! let runner = start_runner(RunnerConfig::new("main").with_channels("root:4"), handlers).await?;
//! ```

mod dispatch;
mod executor;
mod handler;
mod messages;
mod runner;
mod worker_actor;

pub use dispatch::{DEFAULT_DISPATCH_TIMEOUT, Dispatcher, HttpDispatcher, WorkerPool};
pub use executor::{JobExecutor, JobOutcome};
pub use handler::{
    FnHandler, HandlerFuture, HandlerResult, JobContext, JobHandler, JobHandlerRegistry,
};
pub use messages::{ActorError, ActorResult, RunnerMessage, WorkerMessage};
pub use runner::{
    DispatchMode, ERROR_RECOVERY_DELAY, RunnerActor, RunnerArgs, RunnerConfig, RunnerHandle,
    SELECT_TIMEOUT, channel_status, start_runner,
};
pub use worker_actor::{WorkerActor, WorkerArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
