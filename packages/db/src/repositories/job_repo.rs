//! Job repository for the `queue_job` table.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use queue_core::{Job, JobId, JobState};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;
use surrealdb::{Action, Notification};

use crate::schema::{JOB_TABLE, SEQUENCE_TABLE};
use crate::{DbError, get_db};

/// Repository for job persistence operations.
pub struct JobRepository;

/// Internal record type for SurrealDB.
#[derive(Debug, Serialize, Deserialize)]
struct JobRecord {
    #[serde(default, skip_serializing)]
    id: Option<Thing>,
    #[serde(flatten)]
    job: Job,
}

/// A change seen on the job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobChange {
    pub id: JobId,
    pub removed: bool,
}

/// Filter options for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub channel: Option<String>,
    pub func: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn state_names(states: &[JobState]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

/// Order in which the scheduler would pick the jobs.
fn sort_jobs(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        (a.priority, a.date_created, a.seq).cmp(&(b.priority, b.date_created, b.seq))
    });
}

impl JobRepository {
    /// Store a new job and allocate its sequence number.
    ///
    /// A job carrying an identity key is not stored twice: while a job with
    /// the same key is pending or enqueued, that job is returned instead.
    pub async fn create(job: &Job) -> Result<Job, DbError> {
        if let Some(key) = &job.identity_key {
            return Self::create_unique(job, key).await;
        }

        let db = get_db()?;
        let mut job = job.clone();
        job.seq = next_sequence(JOB_TABLE).await?;
        let job_id = job.id.to_string();

        let record: Option<JobRecord> = db.create((JOB_TABLE, job_id)).content(job).await?;

        record
            .map(|r| r.job)
            .ok_or_else(|| DbError::Query("Failed to create job".into()))
    }

    /// Look up the identity key and create the job in one transaction.
    ///
    /// Every creation bumps the same sequence counter, so two transactions
    /// racing on a key conflict and only one of them commits.
    async fn create_unique(job: &Job, key: &str) -> Result<Job, DbError> {
        let db = get_db()?;

        let result = db
            .query(CREATE_UNIQUE)
            .bind(("table", JOB_TABLE))
            .bind(("sequences", SEQUENCE_TABLE))
            .bind(("id", job.id.to_string()))
            .bind(("key", key.to_string()))
            .bind(("states", state_names(&[JobState::Pending, JobState::Enqueued])))
            .bind(("job", job.clone()))
            .await
            .and_then(|response| response.check());

        if let Err(err) = result {
            let err = DbError::from(err);
            if !err.is_concurrency_error() {
                return Err(err);
            }
            tracing::debug!("identity key {} raced with another enqueue: {}", key, err);
        }

        let stored = Self::find_by_identity_key(key)
            .await?
            .ok_or_else(|| DbError::Query(format!("Failed to create job {}", job.id)))?;
        if stored.id != job.id {
            tracing::debug!("job with identity key {} already queued as {}", key, stored.id);
        }
        Ok(stored)
    }

    /// Get a job by ID.
    pub async fn get(id: JobId) -> Result<Job, DbError> {
        Self::find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))
    }

    pub async fn find(id: JobId) -> Result<Option<Job>, DbError> {
        let db = get_db()?;

        let record: Option<JobRecord> = db.select((JOB_TABLE, id.to_string())).await?;

        Ok(record.map(|r| r.job))
    }

    /// Pending or enqueued job with the given identity key.
    pub async fn find_by_identity_key(key: &str) -> Result<Option<Job>, DbError> {
        let db = get_db()?;

        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE identity_key = $key AND state IN $states")
            .bind(("table", JOB_TABLE))
            .bind(("key", key.to_string()))
            .bind(("states", state_names(&[JobState::Pending, JobState::Enqueued])))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        let mut jobs: Vec<Job> = records.into_iter().map(|r| r.job).collect();
        sort_jobs(&mut jobs);

        Ok(jobs.into_iter().next())
    }

    /// Jobs the runner has to schedule or keep track of.
    pub async fn select_not_done() -> Result<Vec<Job>, DbError> {
        let db = get_db()?;

        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE state IN $states")
            .bind(("table", JOB_TABLE))
            .bind(("states", state_names(&JobState::NOT_DONE)))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;

        Ok(records.into_iter().map(|r| r.job).collect())
    }

    /// List jobs with optional filtering, in scheduling order.
    pub async fn list(filter: JobFilter) -> Result<Vec<Job>, DbError> {
        let db = get_db()?;

        let mut conditions = Vec::new();
        let mut bindings: Vec<(&str, String)> = Vec::new();

        if let Some(state) = &filter.state {
            conditions.push("state = $state");
            bindings.push(("state", state.as_str().to_string()));
        }

        if let Some(channel) = &filter.channel {
            conditions.push("channel = $channel");
            bindings.push(("channel", channel.clone()));
        }

        if let Some(func) = &filter.func {
            conditions.push("func = $func");
            bindings.push(("func", func.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!("SELECT * FROM type::table($table) {}", where_clause);

        let mut result = db.query(&query).bind(("table", JOB_TABLE));

        for (name, value) in bindings {
            result = result.bind((name.to_string(), value));
        }

        let mut response = result.await?;
        let records: Vec<JobRecord> = response.take(0)?;

        let mut jobs: Vec<Job> = records.into_iter().map(|r| r.job).collect();
        sort_jobs(&mut jobs);

        Ok(jobs
            .into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Replace a stored job.
    pub async fn update(job: &Job) -> Result<Job, DbError> {
        let db = get_db()?;
        let job_id = job.id.to_string();

        let record: Option<JobRecord> = db
            .update((JOB_TABLE, job_id))
            .content(job.clone())
            .await?;

        record
            .map(|r| r.job)
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", job.id)))
    }

    /// Mark a job enqueued, right before the runner dispatches it.
    pub async fn set_enqueued(id: JobId, now: DateTime<Utc>) -> Result<Job, DbError> {
        let db = get_db()?;

        if Self::find(id).await?.is_none() {
            return Err(DbError::NotFound(format!("Job not found: {}", id)));
        }

        let record: Option<JobRecord> = db
            .update((JOB_TABLE, id.to_string()))
            .merge(serde_json::json!({
                "state": JobState::Enqueued,
                "date_enqueued": now,
                "date_started": null,
            }))
            .await?;

        record
            .map(|r| r.job)
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))
    }

    /// Put failed jobs back in the queue with a fresh retry count.
    ///
    /// Returns the number of requeued jobs; jobs in other states are left alone.
    pub async fn requeue(ids: &[JobId]) -> Result<usize, DbError> {
        let mut requeued = 0;
        for id in ids {
            let mut job = Self::get(*id).await?;
            if job.state != JobState::Failed {
                tracing::debug!("job {} is {}, not requeued", id, job.state);
                continue;
            }
            job.set_pending(None, true);
            Self::update(&job).await?;
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Put an enqueued or started job back to pending, keeping its retry count.
    ///
    /// Returns false when the job is gone or already left those states.
    pub async fn reset_pending(id: JobId) -> Result<bool, DbError> {
        let Some(mut job) = Self::find(id).await? else {
            return Ok(false);
        };
        if !matches!(job.state, JobState::Enqueued | JobState::Started) {
            return Ok(false);
        }
        job.set_pending(None, false);
        Self::update(&job).await?;
        Ok(true)
    }

    /// Reset enqueued and started jobs nobody is running anymore.
    ///
    /// Jobs listed in `running` are left alone. Returns the reset jobs.
    pub async fn requeue_orphans(running: &[JobId]) -> Result<Vec<JobId>, DbError> {
        let db = get_db()?;

        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE state IN $states")
            .bind(("table", JOB_TABLE))
            .bind(("states", state_names(&[JobState::Enqueued, JobState::Started])))
            .await?;
        let records: Vec<JobRecord> = response.take(0)?;

        let mut reset = Vec::new();
        for mut job in records.into_iter().map(|r| r.job) {
            if running.contains(&job.id) {
                continue;
            }
            tracing::warn!("job {} was left {}, back to pending", job.id, job.state);
            job.set_pending(None, false);
            Self::update(&job).await?;
            reset.push(job.id);
        }
        Ok(reset)
    }

    /// Delete a job.
    pub async fn delete(id: JobId) -> Result<(), DbError> {
        let db = get_db()?;

        let _: Option<JobRecord> = db.delete((JOB_TABLE, id.to_string())).await?;

        Ok(())
    }

    /// Delete done jobs finished more than `keep` ago.
    pub async fn vacuum_done(keep: Duration, now: DateTime<Utc>) -> Result<usize, DbError> {
        let Some(cutoff) = now.checked_sub_signed(keep) else {
            return Ok(0);
        };
        let done = Self::list(JobFilter {
            state: Some(JobState::Done),
            ..Default::default()
        })
        .await?;

        let mut removed = 0;
        for job in done {
            if job.date_done.is_some_and(|date| date < cutoff) {
                Self::delete(job.id).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("vacuumed {} done jobs older than {}", removed, cutoff);
        }
        Ok(removed)
    }

    /// Count jobs by state.
    pub async fn count_by_state() -> Result<HashMap<JobState, u64>, DbError> {
        let db = get_db()?;

        let mut result = db
            .query("SELECT state, count() AS count FROM type::table($table) GROUP BY state")
            .bind(("table", JOB_TABLE))
            .await?;

        #[derive(Deserialize)]
        struct StateCount {
            state: Option<JobState>,
            count: i64,
        }

        let counts: Vec<StateCount> = result.take(0)?;

        Ok(counts
            .into_iter()
            .filter_map(|c| c.state.map(|state| (state, c.count as u64)))
            .collect())
    }

    /// Subscribe to changes of the job table.
    ///
    /// The stream ends when the connection drops.
    pub async fn listen() -> Result<BoxStream<'static, JobChange>, DbError> {
        let db = get_db()?;

        let stream: surrealdb::method::Stream<Vec<JobRecord>> = db.select(JOB_TABLE).live().await?;

        Ok(stream
            .filter_map(|item: surrealdb::Result<Notification<JobRecord>>| async move {
                match item {
                    Ok(notification) => Some(JobChange {
                        id: notification.data.job.id,
                        removed: matches!(notification.action, Action::Delete),
                    }),
                    Err(err) => {
                        tracing::warn!("dropping job table notification: {}", err);
                        None
                    }
                }
            })
            .boxed())
    }
}

const CREATE_UNIQUE: &str = r#"
BEGIN TRANSACTION;
LET $existing = (SELECT VALUE id FROM type::table($table) WHERE identity_key = $key AND state IN $states);
IF array::len($existing) = 0 {
    LET $seq = (UPSERT type::thing($sequences, $table) SET current = (current OR 0) + 1 RETURN VALUE current)[0];
    CREATE type::thing($table, $id) CONTENT $job RETURN NONE;
    UPDATE type::thing($table, $id) SET seq = $seq RETURN NONE;
};
COMMIT TRANSACTION;
"#;

async fn next_sequence(name: &str) -> Result<u64, DbError> {
    #[derive(Deserialize)]
    struct Counter {
        current: u64,
    }

    let db = get_db()?;

    let mut response = db
        .query("UPSERT type::thing($table, $name) SET current = (current OR 0) + 1 RETURN AFTER")
        .bind(("table", SEQUENCE_TABLE))
        .bind(("name", name.to_string()))
        .await?;

    let counter: Option<Counter> = response.take(0)?;

    counter
        .map(|c| c.current)
        .ok_or_else(|| DbError::Query(format!("Failed to allocate sequence {}", name)))
}
