//! Priority/ETA queues holding the jobs waiting in a channel.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::channel::ChannelJob;
use crate::{JobId, Priority};

/// Ordered set of jobs with removal of arbitrary members.
///
/// Each member is stored with the key it was added with, so removing a job
/// does not need the job itself.
#[derive(Debug, Clone)]
pub struct PriorityQueue<K> {
    entries: BTreeSet<(K, JobId)>,
    index: HashMap<JobId, K>,
}

impl<K: Ord + Clone> PriorityQueue<K> {
    pub fn new() -> Self {
        Self {
            entries: BTreeSet::new(),
            index: HashMap::new(),
        }
    }

    /// Add a job. Returns false if it was already queued.
    pub fn add(&mut self, id: JobId, key: K) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        self.entries.insert((key.clone(), id));
        self.index.insert(id, key);
        true
    }

    /// Remove a job wherever it sits. Returns false if it was not queued.
    pub fn remove(&mut self, id: JobId) -> bool {
        match self.index.remove(&id) {
            Some(key) => self.entries.remove(&(key, id)),
            None => false,
        }
    }

    /// Smallest job and its key.
    pub fn peek(&self) -> Option<(&K, JobId)> {
        self.entries.first().map(|(key, id)| (key, *id))
    }

    pub fn pop(&mut self) -> Option<(K, JobId)> {
        let (key, id) = self.entries.pop_first()?;
        self.index.remove(&id);
        Some((key, id))
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.entries.iter().map(|(_, id)| *id)
    }
}

impl<K: Ord + Clone> Default for PriorityQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Order of jobs waiting for their ETA.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EtaKey {
    pub eta: DateTime<Utc>,
    pub priority: Priority,
    pub date_created: DateTime<Utc>,
    pub seq: u64,
}

/// Order of jobs ready to run: past-due ETA jobs first, then priority,
/// creation date and sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadyKey {
    pub without_eta: bool,
    pub priority: Priority,
    pub date_created: DateTime<Utc>,
    pub seq: u64,
}

impl ReadyKey {
    fn order(&self) -> (Priority, DateTime<Utc>, u64) {
        (self.priority, self.date_created, self.seq)
    }
}

impl From<EtaKey> for ReadyKey {
    fn from(key: EtaKey) -> Self {
        Self {
            without_eta: false,
            priority: key.priority,
            date_created: key.date_created,
            seq: key.seq,
        }
    }
}

/// Queue of a channel: ready jobs plus jobs held back until their ETA.
#[derive(Debug, Clone, Default)]
pub struct ChannelQueue {
    queue: PriorityQueue<ReadyKey>,
    eta_queue: PriorityQueue<EtaKey>,
    pub sequential: bool,
}

impl ChannelQueue {
    pub fn new(sequential: bool) -> Self {
        Self {
            sequential,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len() + self.eta_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.queue.contains(id) || self.eta_queue.contains(id)
    }

    pub fn add(&mut self, job: &ChannelJob) {
        if self.contains(job.id) {
            return;
        }
        match job.eta {
            Some(eta) => {
                self.eta_queue.add(
                    job.id,
                    EtaKey {
                        eta,
                        priority: job.priority,
                        date_created: job.date_created,
                        seq: job.seq,
                    },
                );
            }
            None => {
                self.queue.add(
                    job.id,
                    ReadyKey {
                        without_eta: true,
                        priority: job.priority,
                        date_created: job.date_created,
                        seq: job.seq,
                    },
                );
            }
        }
    }

    pub fn remove(&mut self, id: JobId) {
        self.eta_queue.remove(id);
        self.queue.remove(id);
    }

    /// Next job allowed to run at `now`.
    pub fn pop(&mut self, now: DateTime<Utc>) -> Option<JobId> {
        while self
            .eta_queue
            .peek()
            .is_some_and(|(key, _)| key.eta <= now)
        {
            if let Some((key, id)) = self.eta_queue.pop() {
                self.queue.add(id, key.into());
            }
        }
        if self.sequential
            && let (Some((eta_key, _)), Some((ready_key, _))) =
                (self.eta_queue.peek(), self.queue.peek())
            && (eta_key.priority, eta_key.date_created, eta_key.seq) < ready_key.order()
        {
            // the job waiting for its eta comes first, keep the order
            return None;
        }
        self.queue.pop().map(|(_, id)| id)
    }

    /// Earliest ETA of the held-back jobs, folded into `wakeup_time`.
    pub fn wakeup_time(&self, wakeup_time: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match (self.eta_queue.peek(), wakeup_time) {
            (Some((key, _)), Some(current)) => Some(current.min(key.eta)),
            (Some((key, _)), None) => Some(key.eta),
            (None, current) => current,
        }
    }

    /// Queued job ids, ready ones first.
    pub fn ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.queue.ids().chain(self.eta_queue.ids())
    }
}
