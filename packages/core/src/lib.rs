//! Core domain types for the job queue and its channel scheduler.
//!
//! This crate has no I/O:
//! - Job, JobState and RetryPattern for deferred work items
//! - JobError for the outcome classes of an execution
//! - JobPayload and Whitelist for safe payload decoding
//! - ChannelQueue and ChannelManager for priority/ETA scheduling
//! - Events for real-time updates

pub mod channel;
mod error;
mod events;
mod job;
mod manager;
mod payload;
pub mod queue;

pub use channel::{Channel, ChannelConfig, ChannelId, ChannelJob, ChannelStatus, ConfigError};
pub use error::{CONCURRENCY_RETRY_SECS, JobError, error_chain};
pub use events::JobEvent;
pub use job::{
    DEFAULT_MAX_RETRIES, Job, JobId, JobNotification, JobState, MAX_DELAY_SECS, Priority,
    RETRY_INTERVAL, RetryPattern, delay_after,
};
pub use manager::{ChannelError, ChannelManager, ROOT_CHANNEL};
pub use payload::{JobPayload, PayloadError, Whitelist, as_datetime, datetime_value};
