//! Channel manager: owns the channel tree and every job it schedules.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::channel::{
    Channel, ChannelConfig, ChannelId, ChannelJob, ChannelStatus, ConfigError, parse_simple_config,
    qualified_name,
};
use crate::{JobId, JobNotification, JobState, delay_after};

/// Name of the channel at the top of the tree.
pub const ROOT_CHANNEL: &str = "root";

/// Channel lookup and configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Channel {0} not found")]
    NotFound(String),

    #[error("Invalid channel name {0}")]
    InvalidName(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Tree of channels plus the jobs they hold.
///
/// All scheduling state lives here and is only mutated through `&mut self`,
/// so a single owner (the runner) drives it.
#[derive(Debug, Clone)]
pub struct ChannelManager {
    channels: Vec<Channel>,
    by_name: HashMap<String, ChannelId>,
    jobs: HashMap<JobId, ChannelJob>,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelManager {
    /// Create a manager with a root channel of capacity 1.
    pub fn new() -> Self {
        let root = Channel::new(ROOT_CHANNEL, None, Some(1));
        let mut by_name = HashMap::new();
        by_name.insert(ROOT_CHANNEL.to_string(), ChannelId::ROOT);
        Self {
            channels: vec![root],
            by_name,
            jobs: HashMap::new(),
        }
    }

    /// Parse a configuration string, see [`parse_simple_config`].
    pub fn parse_simple_config(config: &str) -> Result<Vec<ChannelConfig>, ConfigError> {
        parse_simple_config(config)
    }

    /// Configure channels from a configuration string, creating them as needed.
    pub fn simple_configure(&mut self, config: &str) -> Result<(), ChannelError> {
        for channel_config in parse_simple_config(config)? {
            self.get_channel_from_config(&channel_config)?;
        }
        Ok(())
    }

    /// Create (if needed) and configure a channel.
    pub fn get_channel_from_config(
        &mut self,
        config: &ChannelConfig,
    ) -> Result<ChannelId, ChannelError> {
        let capacity = config.effective_capacity()?;
        let id = self.get_channel_by_name(&config.name, true)?;
        let channel = &mut self.channels[id.0];
        channel.apply_config(config, capacity);
        tracing::info!("configured channel {}", channel);
        Ok(id)
    }

    /// Look up a channel by full or short name (`sub` is `root.sub`).
    pub fn find_channel(&self, name: &str) -> Option<ChannelId> {
        if name.is_empty() || name == ROOT_CHANNEL {
            return Some(ChannelId::ROOT);
        }
        self.by_name.get(&qualified_name(name)).copied()
    }

    /// Look up a channel, creating it and its ancestors when `autocreate`.
    pub fn get_channel_by_name(
        &mut self,
        name: &str,
        autocreate: bool,
    ) -> Result<ChannelId, ChannelError> {
        if let Some(id) = self.find_channel(name) {
            return Ok(id);
        }
        let full_name = qualified_name(name);
        if !autocreate {
            return Err(ChannelError::NotFound(full_name));
        }

        let mut parent = ChannelId::ROOT;
        for part in full_name.split('.').skip(1) {
            if part.is_empty() {
                return Err(ChannelError::InvalidName(full_name));
            }
            let existing = self.channels[parent.0]
                .children
                .iter()
                .copied()
                .find(|child| self.channels[child.0].name == part);
            parent = match existing {
                Some(child) => child,
                None => {
                    let id = ChannelId(self.channels.len());
                    let channel = Channel::new(part, Some((&self.channels[parent.0], parent)), None);
                    self.by_name.insert(channel.full_name.clone(), id);
                    self.channels.push(channel);
                    self.channels[parent.0].children.push(id);
                    id
                }
            };
        }
        Ok(parent)
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        &self.channels[id.0]
    }

    pub fn root(&self) -> &Channel {
        self.channel(ChannelId::ROOT)
    }

    /// All channels, parents before children.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn status(&self) -> Vec<ChannelStatus> {
        self.channels.iter().map(Channel::status).collect()
    }

    pub fn job(&self, id: JobId) -> Option<&ChannelJob> {
        self.jobs.get(&id)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Apply a job change read from storage.
    pub fn notify(&mut self, notification: JobNotification) {
        let channel = match self.find_channel(&notification.channel) {
            Some(id) => id,
            None => {
                tracing::warn!(
                    "unknown channel {}, using root channel for job {}",
                    notification.channel,
                    notification.id
                );
                ChannelId::ROOT
            }
        };

        if let Some(job) = self.jobs.get(&notification.id)
            && (job.seq != notification.seq
                || job.priority != notification.priority
                || job.eta != notification.eta
                || job.channel != channel
                || job.db_name != notification.db_name
                || job.date_created != notification.date_created)
        {
            // scheduling order depends on these, replace the job
            tracing::debug!("job {} properties changed, rescheduling it", notification.id);
            self.remove_job(notification.id);
        }

        let id = notification.id;
        self.jobs.entry(id).or_insert_with(|| ChannelJob {
            id,
            db_name: notification.db_name,
            channel,
            seq: notification.seq,
            date_created: notification.date_created,
            priority: notification.priority,
            eta: notification.eta,
        });

        match notification.state {
            JobState::Done => self.set_done(id),
            JobState::Pending => self.set_pending(id),
            JobState::Enqueued | JobState::Started => self.set_running(id),
            JobState::Failed => self.set_failed(id),
        }
    }

    /// Forget a job entirely. Returns false if it was unknown.
    pub fn remove_job(&mut self, id: JobId) -> bool {
        match self.jobs.remove(&id) {
            Some(job) => {
                self.remove_from(job.channel, id);
                true
            }
            None => false,
        }
    }

    /// Forget every job of a database.
    pub fn remove_db(&mut self, db_name: &str) {
        let ids: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.db_name == db_name)
            .map(|job| job.id)
            .collect();
        for id in ids {
            self.remove_job(id);
        }
    }

    /// Jobs that may start now, marked running along their channel path.
    pub fn get_jobs_to_run(&mut self, now: DateTime<Utc>) -> Vec<ChannelJob> {
        jobs_to_run(&mut self.channels, &self.jobs, ChannelId::ROOT, now)
            .into_iter()
            .filter_map(|id| self.jobs.get(&id).cloned())
            .collect()
    }

    /// When the runner should look again, if nothing else wakes it up.
    pub fn get_wakeup_time(&self) -> Option<DateTime<Utc>> {
        wakeup_time(&self.channels, ChannelId::ROOT, None)
    }

    fn set_done(&mut self, id: JobId) {
        if let Some(job) = self.jobs.remove(&id) {
            self.remove_from(job.channel, id);
            tracing::debug!("job {} marked done in channel {}", id, self.channels[job.channel.0]);
        }
    }

    fn set_pending(&mut self, id: JobId) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        let channel = &mut self.channels[job.channel.0];
        if channel.queue.contains(id) {
            return;
        }
        channel.queue.add(job);
        channel.running.remove(&id);
        channel.failed.remove(&id);
        tracing::debug!("job {} marked pending in channel {}", id, channel);
        if let Some(parent) = channel.parent {
            self.remove_from(parent, id);
        }
    }

    fn set_running(&mut self, id: JobId) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        // a job admitted by a leaf may still wait in a parent queue
        let mut current = Some(job.channel);
        while let Some(channel_id) = current {
            let channel = &mut self.channels[channel_id.0];
            channel.queue.remove(id);
            channel.failed.remove(&id);
            if channel.running.insert(id) {
                tracing::debug!("job {} marked running in channel {}", id, channel);
            }
            current = channel.parent;
        }
    }

    fn set_failed(&mut self, id: JobId) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        let channel = &mut self.channels[job.channel.0];
        if channel.failed.contains(&id) {
            return;
        }
        channel.queue.remove(id);
        channel.running.remove(&id);
        channel.failed.insert(id);
        tracing::debug!("job {} marked failed in channel {}", id, channel);
        if let Some(parent) = channel.parent {
            self.remove_from(parent, id);
        }
    }

    /// Drop a job from a channel and all its ancestors.
    fn remove_from(&mut self, channel: ChannelId, id: JobId) {
        let mut current = Some(channel);
        while let Some(channel_id) = current {
            let channel = &mut self.channels[channel_id.0];
            channel.forget(id);
            current = channel.parent;
        }
    }
}

fn jobs_to_run(
    channels: &mut [Channel],
    jobs: &HashMap<JobId, ChannelJob>,
    id: ChannelId,
    now: DateTime<Utc>,
) -> Vec<JobId> {
    // jobs admitted by children compete in this channel
    let children = channels[id.0].children.clone();
    for child in children {
        for job_id in jobs_to_run(channels, jobs, child, now) {
            if let Some(job) = jobs.get(&job_id) {
                channels[id.0].queue.add(job);
            }
        }
    }

    let channel = &mut channels[id.0];
    if channel.throttle > 0
        && let Some(until) = channel.pause_until
    {
        if now < until {
            if channel.has_capacity() {
                tracing::debug!(
                    "channel {} paused until {} because of throttle delay {}",
                    channel,
                    until,
                    channel.throttle
                );
            }
            return Vec::new();
        }
        channel.pause_until = None;
        tracing::debug!("channel {} unpaused at {}", channel, now);
    }

    let mut runnable = Vec::new();
    while channel.has_capacity() {
        let Some(job_id) = channel.queue.pop(now) else {
            break;
        };
        channel.running.insert(job_id);
        tracing::debug!("job {} marked running in channel {}", job_id, channel);
        runnable.push(job_id);
        if channel.throttle > 0 {
            let until = delay_after(now, channel.throttle);
            channel.pause_until = Some(until);
            tracing::debug!("pausing channel {} until {}", channel, until);
            break;
        }
    }
    runnable
}

fn wakeup_time(
    channels: &[Channel],
    id: ChannelId,
    wakeup: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let channel = &channels[id.0];
    if !channel.has_capacity() {
        // a finishing job will wake the runner up
        return wakeup;
    }
    if let Some(until) = channel.pause_until {
        // jobs of children would end up in this paused channel anyway
        return Some(wakeup.map_or(until, |current| current.min(until)));
    }
    let mut wakeup = channel.queue.wakeup_time(wakeup);
    for child in &channel.children {
        wakeup = wakeup_time(channels, *child, wakeup);
    }
    wakeup
}
