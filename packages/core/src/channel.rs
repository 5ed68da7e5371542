//! Channels: capacity-limited scheduling nodes.
//!
//! Jobs flow from leaf channels towards the root like water through pipes of
//! limited capacity. A job only runs once every channel on its path to the
//! root has room for it.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::queue::ChannelQueue;
use crate::{JobId, MAX_DELAY_SECS, Priority, ROOT_CHANNEL};

/// Index of a channel in its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelId(pub(crate) usize);

impl ChannelId {
    pub const ROOT: ChannelId = ChannelId(0);
}

/// A job as known by the scheduler.
///
/// Scheduling fields never change for a given value: when they do in
/// storage, the manager replaces the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelJob {
    pub id: JobId,
    pub db_name: String,
    pub channel: ChannelId,
    pub seq: u64,
    pub date_created: DateTime<Utc>,
    pub priority: Priority,
    pub eta: Option<DateTime<Utc>>,
}

/// Scheduling node.
#[derive(Debug, Clone)]
pub struct Channel {
    pub(crate) name: String,
    pub(crate) full_name: String,
    pub(crate) parent: Option<ChannelId>,
    pub(crate) children: Vec<ChannelId>,
    pub(crate) queue: ChannelQueue,
    pub(crate) running: HashSet<JobId>,
    pub(crate) failed: HashSet<JobId>,
    /// Throttled channels do not dispatch before this instant.
    pub(crate) pause_until: Option<DateTime<Utc>>,
    /// Maximum running jobs, unbounded when `None`.
    pub capacity: Option<u32>,
    /// Minimum delay between two dispatches, in seconds.
    pub throttle: u64,
    pub sequential: bool,
}

impl Channel {
    pub(crate) fn new(name: &str, parent: Option<(&Channel, ChannelId)>, capacity: Option<u32>) -> Self {
        let full_name = match parent {
            Some((parent, _)) => format!("{}.{}", parent.full_name, name),
            None => name.to_string(),
        };
        Self {
            name: name.to_string(),
            full_name,
            parent: parent.map(|(_, id)| id),
            children: Vec::new(),
            queue: ChannelQueue::default(),
            running: HashSet::new(),
            failed: HashSet::new(),
            pause_until: None,
            capacity,
            throttle: 0,
            sequential: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted path from the root channel.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn parent(&self) -> Option<ChannelId> {
        self.parent
    }

    pub fn children(&self) -> &[ChannelId] {
        &self.children
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn failed(&self) -> usize {
        self.failed.len()
    }

    pub fn pause_until(&self) -> Option<DateTime<Utc>> {
        self.pause_until
    }

    pub fn has_queued(&self, id: JobId) -> bool {
        self.queue.contains(id)
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.running.contains(&id)
    }

    pub fn is_failed(&self, id: JobId) -> bool {
        self.failed.contains(&id)
    }

    /// Whether the channel can start one more job.
    pub fn has_capacity(&self) -> bool {
        if self.sequential && !self.failed.is_empty() {
            // a sequential channel blocks on failed jobs
            return false;
        }
        match self.capacity {
            None => true,
            Some(capacity) => self.running.len() < capacity as usize,
        }
    }

    /// Drop a job from every set of this channel.
    pub(crate) fn forget(&mut self, id: JobId) {
        self.queue.remove(id);
        self.running.remove(&id);
        self.failed.remove(&id);
    }

    pub(crate) fn apply_config(&mut self, config: &ChannelConfig, capacity: Option<u32>) {
        self.capacity = capacity;
        self.sequential = config.sequential;
        self.throttle = config.throttle;
        self.queue.sequential = config.sequential;
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            name: self.full_name.clone(),
            capacity: self.capacity,
            sequential: self.sequential,
            throttle: self.throttle,
            queued: self.queue.len(),
            running: self.running.len(),
            failed: self.failed.len(),
            pause_until: self.pause_until,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let capacity = self
            .capacity
            .map_or_else(|| "∞".to_string(), |c| c.to_string());
        write!(
            f,
            "{}(C:{},Q:{},R:{},F:{})",
            self.full_name,
            capacity,
            self.queue.len(),
            self.running.len(),
            self.failed.len()
        )
    }
}

/// Point-in-time view of a channel, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub capacity: Option<u32>,
    pub sequential: bool,
    pub throttle: u64,
    pub queued: usize,
    pub running: usize,
    pub failed: usize,
    pub pause_until: Option<DateTime<Utc>>,
}

/// Configuration of a single channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub name: String,
    pub capacity: Option<u32>,
    pub sequential: bool,
    pub throttle: u64,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, capacity: Option<u32>) -> Self {
        Self {
            name: name.into(),
            capacity,
            sequential: false,
            throttle: 0,
        }
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn with_throttle(mut self, seconds: u64) -> Self {
        self.throttle = seconds;
        self
    }

    /// Capacity after applying the sequential and zero-capacity rules.
    pub fn effective_capacity(&self) -> Result<Option<u32>, ConfigError> {
        let capacity = self.capacity.filter(|c| *c > 0);
        if !self.sequential {
            return Ok(capacity);
        }
        match capacity {
            None => Ok(Some(1)),
            Some(1) => Ok(Some(1)),
            Some(_) => Err(ConfigError::SequentialCapacity(self.name.clone())),
        }
    }
}

/// Channel configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid channel config {config}: missing channel name")]
    MissingName { config: String },

    #[error("Invalid channel config {config}: invalid capacity {capacity}")]
    InvalidCapacity { config: String, capacity: String },

    #[error("Invalid channel config {config}: incorrect config item {item}")]
    InvalidItem { config: String, item: String },

    #[error("Invalid channel config {config}: duplicate key {key}")]
    DuplicateKey { config: String, key: String },

    #[error("Invalid channel config {config}: duplicate channel {name}")]
    DuplicateChannel { config: String, name: String },

    #[error("Invalid channel config {config}: invalid value {value} for {key}")]
    InvalidValue {
        config: String,
        key: String,
        value: String,
    },

    #[error("A sequential channel must have a capacity of 1: {0}")]
    SequentialCapacity(String),
}

/// Parse a configuration string such as `root:4,root.export:2:throttle=5`.
///
/// Items are separated by commas or newlines. Each item is
/// `name[:capacity[:key[=value]]...]`; a bare name gets a capacity of 1.
pub fn parse_simple_config(config: &str) -> Result<Vec<ChannelConfig>, ConfigError> {
    let normalized = config.replace('\n', ",");
    let mut configs: Vec<ChannelConfig> = Vec::new();

    for item in normalized.split(',').map(str::trim) {
        if item.is_empty() {
            continue;
        }
        let mut parts = item.split(':').map(str::trim);
        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(ConfigError::MissingName {
                config: config.to_string(),
            });
        }
        if configs
            .iter()
            .any(|c| qualified_name(&c.name) == qualified_name(name))
        {
            return Err(ConfigError::DuplicateChannel {
                config: config.to_string(),
                name: name.to_string(),
            });
        }

        let mut channel = ChannelConfig::new(name, Some(1));
        if let Some(capacity) = parts.next() {
            channel.capacity =
                Some(capacity.parse().map_err(|_| ConfigError::InvalidCapacity {
                    config: config.to_string(),
                    capacity: capacity.to_string(),
                })?);
        }

        let mut seen = HashSet::new();
        for option in parts {
            let kv: Vec<&str> = option.split('=').map(str::trim).collect();
            let (key, value) = match kv.as_slice() {
                [key] => (*key, None),
                [key, value] => (*key, Some(*value)),
                _ => {
                    return Err(ConfigError::InvalidItem {
                        config: config.to_string(),
                        item: option.to_string(),
                    });
                }
            };
            if !seen.insert(key) {
                return Err(ConfigError::DuplicateKey {
                    config: config.to_string(),
                    key: key.to_string(),
                });
            }
            let invalid = |value: &str| ConfigError::InvalidValue {
                config: config.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "sequential" => {
                    channel.sequential = match value {
                        None | Some("1") | Some("true") | Some("True") | Some("yes") => true,
                        Some("0") | Some("false") | Some("False") | Some("no") => false,
                        Some(other) => return Err(invalid(other)),
                    };
                }
                "throttle" => {
                    let value = value.unwrap_or_default();
                    channel.throttle = value
                        .parse()
                        .ok()
                        .filter(|seconds| *seconds <= MAX_DELAY_SECS)
                        .ok_or_else(|| invalid(value))?;
                }
                other => {
                    tracing::warn!("ignoring unknown option {} for channel {}", other, name);
                }
            }
        }
        configs.push(channel);
    }

    Ok(configs)
}

/// Full name of a channel: `sub` and `root.sub` are the same channel.
pub(crate) fn qualified_name(name: &str) -> String {
    let prefix = format!("{ROOT_CHANNEL}.");
    if name == ROOT_CHANNEL || name.starts_with(&prefix) {
        name.to_string()
    } else {
        format!("{prefix}{name}")
    }
}
