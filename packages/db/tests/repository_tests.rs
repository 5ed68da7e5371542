#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use queue_core::{Job, JobState, Priority, RetryPattern};
use serde_json::json;

use db::{DbError, repositories::JobFilter, repositories::JobRepository};

#[tokio::test]
async fn test_create_allocates_sequence() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let first = JobRepository::create(&Job::new("mail.send", json!([1]))).await?;
    let second = JobRepository::create(&Job::new("mail.send", json!([2]))).await?;
    assert!(first.seq > 0);
    assert_eq!(second.seq, first.seq + 1);

    let loaded = JobRepository::get(first.id).await?;
    assert_eq!(loaded.id, first.id);
    assert_eq!(loaded.state, JobState::Pending);
    assert_eq!(loaded.args, json!([1]));

    let missing = JobRepository::get(queue_core::JobId::new()).await;
    assert!(matches!(missing, Err(DbError::NotFound(_))));

    Ok(())
}

#[tokio::test]
async fn test_job_fields_survive_storage() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let eta = Utc::now() + chrono::Duration::minutes(5);
    let job = Job::new("report.build", json!({"kwargs": {"year": 2024}}))
        .with_channel("root.reports")
        .with_priority(Priority(3))
        .with_eta(eta)
        .with_retry_pattern(RetryPattern::new([(1, 10), (5, 60)]))
        .with_description("Yearly report");
    let created = JobRepository::create(&job).await?;

    let loaded = JobRepository::get(created.id).await?;
    assert_eq!(loaded.channel, "root.reports");
    assert_eq!(loaded.priority, Priority(3));
    assert_eq!(loaded.eta, Some(eta));
    assert_eq!(loaded.retry_pattern.seconds_for(6), Some(60));
    assert_eq!(loaded.description.as_deref(), Some("Yearly report"));

    Ok(())
}

#[tokio::test]
async fn test_identity_key_deduplicates() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let first = JobRepository::create(
        &Job::new("partner.sync", json!([7])).with_identity_key("partner-7"),
    )
    .await?;
    let again = JobRepository::create(
        &Job::new("partner.sync", json!([7])).with_identity_key("partner-7"),
    )
    .await?;
    assert_eq!(again.id, first.id);

    // a finished job no longer blocks a new one
    let mut done = JobRepository::get(first.id).await?;
    done.set_done(None, Utc::now());
    JobRepository::update(&done).await?;

    let fresh = JobRepository::create(
        &Job::new("partner.sync", json!([7])).with_identity_key("partner-7"),
    )
    .await?;
    assert_ne!(fresh.id, first.id);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_identity_key_stores_one_job() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let job_a = Job::new("partner.sync", json!([8])).with_identity_key("partner-8");
    let job_b = Job::new("partner.sync", json!([8])).with_identity_key("partner-8");
    let (a, b) = tokio::join!(JobRepository::create(&job_a), JobRepository::create(&job_b));
    assert_eq!(a?.id, b?.id);

    let stored = JobRepository::list(JobFilter {
        func: Some("partner.sync".into()),
        ..Default::default()
    })
    .await?;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].seq > 0);

    Ok(())
}

#[tokio::test]
async fn test_orphaned_jobs_go_back_to_pending() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let now = Utc::now();
    let enqueued = JobRepository::create(&Job::new("echo", json!([1]))).await?;
    JobRepository::set_enqueued(enqueued.id, now).await?;

    let mut started = JobRepository::create(&Job::new("echo", json!([2]))).await?;
    JobRepository::set_enqueued(started.id, now).await?;
    started = JobRepository::get(started.id).await?;
    started.set_started(now);
    started.retry = 2;
    JobRepository::update(&started).await?;

    let busy = JobRepository::create(&Job::new("echo", json!([3]))).await?;
    JobRepository::set_enqueued(busy.id, now).await?;
    let pending = JobRepository::create(&Job::new("echo", json!([4]))).await?;

    let mut reset = JobRepository::requeue_orphans(&[busy.id]).await?;
    reset.sort();
    let mut expected = vec![enqueued.id, started.id];
    expected.sort();
    assert_eq!(reset, expected);

    let started = JobRepository::get(started.id).await?;
    assert_eq!(started.state, JobState::Pending);
    assert_eq!(started.retry, 2);
    assert!(started.date_started.is_none());
    assert_eq!(JobRepository::get(busy.id).await?.state, JobState::Enqueued);

    assert!(JobRepository::reset_pending(busy.id).await?);
    assert_eq!(JobRepository::get(busy.id).await?.state, JobState::Pending);
    assert!(!JobRepository::reset_pending(pending.id).await?);
    assert!(!JobRepository::reset_pending(queue_core::JobId::new()).await?);

    Ok(())
}

#[tokio::test]
async fn test_state_transitions() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let job = JobRepository::create(&Job::new("echo", json!([]))).await?;

    let now = Utc::now();
    let enqueued = JobRepository::set_enqueued(job.id, now).await?;
    assert_eq!(enqueued.state, JobState::Enqueued);
    assert_eq!(enqueued.date_enqueued, Some(now));
    assert_eq!(enqueued.func, "echo");

    let missing = JobRepository::set_enqueued(queue_core::JobId::new(), now).await;
    assert!(matches!(missing, Err(DbError::NotFound(_))));

    let mut failed = enqueued;
    failed.retry = 3;
    failed.set_failed("boom");
    JobRepository::update(&failed).await?;

    let pending = JobRepository::create(&Job::new("echo", json!([]))).await?;
    let requeued = JobRepository::requeue(&[failed.id, pending.id]).await?;
    assert_eq!(requeued, 1);

    let reloaded = JobRepository::get(failed.id).await?;
    assert_eq!(reloaded.state, JobState::Pending);
    assert_eq!(reloaded.retry, 0);

    JobRepository::delete(pending.id).await?;
    assert!(JobRepository::find(pending.id).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_select_and_list() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let low = JobRepository::create(&Job::new("a", json!([])).with_priority(Priority(20))).await?;
    let high = JobRepository::create(&Job::new("b", json!([])).with_priority(Priority(1))).await?;
    let mut done = JobRepository::create(&Job::new("c", json!([])).with_channel("root.x")).await?;
    done.set_done(Some("ok".into()), Utc::now());
    JobRepository::update(&done).await?;

    let not_done = JobRepository::select_not_done().await?;
    assert_eq!(not_done.len(), 2);
    assert!(not_done.iter().all(|j| j.state != JobState::Done));

    let all = JobRepository::list(JobFilter::default()).await?;
    assert_eq!(all.first().map(|j| j.id), Some(high.id));

    let pending = JobRepository::list(JobFilter {
        state: Some(JobState::Pending),
        ..Default::default()
    })
    .await?;
    assert_eq!(pending.iter().map(|j| j.id).collect::<Vec<_>>(), vec![high.id, low.id]);

    let in_channel = JobRepository::list(JobFilter {
        channel: Some("root.x".to_string()),
        ..Default::default()
    })
    .await?;
    assert_eq!(in_channel.len(), 1);

    let paged = JobRepository::list(JobFilter {
        limit: Some(1),
        offset: Some(1),
        ..Default::default()
    })
    .await?;
    assert_eq!(paged.len(), 1);

    let counts = JobRepository::count_by_state().await?;
    assert_eq!(counts.get(&JobState::Pending).copied().unwrap_or(0), 2);
    assert_eq!(counts.get(&JobState::Done).copied().unwrap_or(0), 1);

    Ok(())
}

#[tokio::test]
async fn test_vacuum_done() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let now = Utc::now();
    let mut old = JobRepository::create(&Job::new("a", json!([]))).await?;
    old.set_done(None, now - chrono::Duration::days(10));
    JobRepository::update(&old).await?;

    let mut recent = JobRepository::create(&Job::new("b", json!([]))).await?;
    recent.set_done(None, now - chrono::Duration::hours(1));
    JobRepository::update(&recent).await?;

    let pending = JobRepository::create(&Job::new("c", json!([]))).await?;

    let removed = JobRepository::vacuum_done(chrono::Duration::days(7), now).await?;
    assert_eq!(removed, 1);
    assert!(JobRepository::find(old.id).await?.is_none());
    assert!(JobRepository::find(recent.id).await?.is_some());
    assert!(JobRepository::find(pending.id).await?.is_some());

    Ok(())
}

#[tokio::test]
async fn test_listen_reports_changes() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_db().await?;

    let mut changes = JobRepository::listen().await?;

    let job = JobRepository::create(&Job::new("echo", json!([]))).await?;
    let created = tokio::time::timeout(Duration::from_secs(5), changes.next()).await?;
    assert_eq!(created.map(|c| (c.id, c.removed)), Some((job.id, false)));

    JobRepository::delete(job.id).await?;
    let removed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(change) = changes.next().await {
            if change.removed {
                return Some(change);
            }
        }
        None
    })
    .await?;
    assert_eq!(removed.map(|c| c.id), Some(job.id));

    Ok(())
}
