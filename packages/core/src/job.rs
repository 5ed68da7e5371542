//! Job domain types for deferred work items.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Default delay before retrying a job when no retry pattern is set (seconds).
pub const RETRY_INTERVAL: u64 = 10 * 60;

/// Default number of attempts before a retryable job is failed.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Longest delay accepted for retries and throttling (ten years, in seconds).
pub const MAX_DELAY_SECS: u64 = 10 * 365 * 24 * 3600;

/// `now` plus `seconds`, saturating at the latest representable time.
pub fn delay_after(now: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    i64::try_from(seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution priority. Smaller values run first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const DEFAULT: Priority = Priority(10);
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current state of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for the runner to pick it up.
    #[default]
    Pending,
    /// Handed to a worker by the runner, not started yet.
    Enqueued,
    /// A worker is executing it.
    Started,
    /// Finished, successfully or with nothing to do.
    Done,
    /// Failed terminally; waits for a human to requeue it.
    Failed,
}

impl JobState {
    /// States the runner keeps track of.
    pub const NOT_DONE: [JobState; 4] = [
        JobState::Pending,
        JobState::Enqueued,
        JobState::Started,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Enqueued => "enqueued",
            JobState::Started => "started",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay schedule keyed by retry count.
///
/// `{1: 60, 5: 300}` waits one minute for retries 1 to 4 and five minutes
/// from the fifth retry on. Stored as a list of `[retry, seconds]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(u32, u64)>", into = "Vec<(u32, u64)>")]
pub struct RetryPattern(pub BTreeMap<u32, u64>);

impl From<Vec<(u32, u64)>> for RetryPattern {
    fn from(entries: Vec<(u32, u64)>) -> Self {
        Self::new(entries)
    }
}

impl From<RetryPattern> for Vec<(u32, u64)> {
    fn from(pattern: RetryPattern) -> Self {
        pattern.0.into_iter().collect()
    }
}

impl RetryPattern {
    pub fn new(entries: impl IntoIterator<Item = (u32, u64)>) -> Self {
        Self(entries.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Delay in seconds for the given retry count.
    pub fn seconds_for(&self, retry: u32) -> Option<u64> {
        self.0
            .range(..=retry)
            .next_back()
            .or_else(|| self.0.iter().next())
            .map(|(_, seconds)| *seconds)
    }

    /// Longest delay of the pattern.
    pub fn max_seconds(&self) -> u64 {
        self.0.values().copied().max().unwrap_or(0)
    }
}

/// Scheduling projection of a job, as consumed by the channel manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotification {
    pub db_name: String,
    pub channel: String,
    pub id: JobId,
    pub seq: u64,
    pub date_created: DateTime<Utc>,
    pub priority: Priority,
    pub eta: Option<DateTime<Utc>>,
    pub state: JobState,
}

/// A job represents a unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    #[serde(rename = "uuid")]
    pub id: JobId,
    /// Insertion sequence, allocated by storage.
    #[serde(default)]
    pub seq: u64,
    /// Full or short name of the channel the job runs in.
    pub channel: String,
    /// Name of the registered function that executes the job.
    pub func: String,
    /// Arguments passed to the function.
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: Priority,
    /// Earliest time the job may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    /// Number of attempts so far.
    #[serde(default)]
    pub retry: u32,
    /// Maximum attempts, 0 for unlimited.
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "RetryPattern::is_empty")]
    pub retry_pattern: RetryPattern,
    pub state: JobState,
    /// Result or postpone message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Captured error chain of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_info: Option<String>,
    /// Jobs sharing an identity key are not enqueued twice while one is not done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<String>,
    /// Timeout in seconds for job execution.
    pub timeout_secs: u64,
    pub date_created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_enqueued: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_done: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job in the root channel.
    pub fn new(func: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            seq: 0,
            channel: "root".to_string(),
            func: func.into(),
            args,
            description: None,
            priority: Priority::default(),
            eta: None,
            retry: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_pattern: RetryPattern::default(),
            state: JobState::Pending,
            result: None,
            exc_info: None,
            identity_key: None,
            timeout_secs: 300, // 5 minutes default
            date_created: Utc::now(),
            date_enqueued: None,
            date_started: None,
            date_done: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_pattern(mut self, pattern: RetryPattern) -> Self {
        self.retry_pattern = pattern;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_identity_key(mut self, key: impl Into<String>) -> Self {
        self.identity_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Put the job back in the pending state.
    pub fn set_pending(&mut self, result: Option<String>, reset_retry: bool) {
        self.state = JobState::Pending;
        self.date_enqueued = None;
        self.date_started = None;
        if reset_retry {
            self.retry = 0;
        }
        if result.is_some() {
            self.result = result;
        }
    }

    pub fn set_enqueued(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Enqueued;
        self.date_enqueued = Some(now);
        self.date_started = None;
    }

    pub fn set_started(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Started;
        self.date_started = Some(now);
    }

    pub fn set_done(&mut self, result: Option<String>, now: DateTime<Utc>) {
        self.state = JobState::Done;
        self.exc_info = None;
        self.date_done = Some(now);
        if result.is_some() {
            self.result = result;
        }
    }

    pub fn set_failed(&mut self, exc_info: impl Into<String>) {
        self.state = JobState::Failed;
        self.exc_info = Some(exc_info.into());
    }

    /// Delay the next attempt.
    ///
    /// Without an explicit delay the retry pattern decides.
    pub fn postpone(&mut self, result: Option<String>, seconds: Option<u64>, now: DateTime<Utc>) {
        let seconds = seconds.unwrap_or_else(|| self.retry_seconds());
        self.eta = Some(delay_after(now, seconds));
        self.exc_info = None;
        if result.is_some() {
            self.result = result;
        }
    }

    /// Delay before the next retry, for the current retry count.
    pub fn retry_seconds(&self) -> u64 {
        self.retry_pattern
            .seconds_for(self.retry)
            .unwrap_or(RETRY_INTERVAL)
    }

    /// Whether another retry would exceed `max_retries`.
    pub fn is_retry_exhausted(&self) -> bool {
        self.max_retries > 0 && self.retry >= self.max_retries
    }

    /// Project the fields the channel manager schedules on.
    pub fn channel_job(&self, db_name: impl Into<String>) -> JobNotification {
        JobNotification {
            db_name: db_name.into(),
            channel: self.channel.clone(),
            id: self.id,
            seq: self.seq,
            date_created: self.date_created,
            priority: self.priority,
            eta: self.eta,
            state: self.state,
        }
    }
}
