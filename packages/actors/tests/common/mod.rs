use std::sync::LazyLock;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use db::repositories::JobRepository;
use db::{DbConfig, DbError};
use queue_core::{Job, JobId, JobState};

static TEST_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Runtime that owns the shared store connection. Each `#[tokio::test]` has its
/// own runtime, so the connection must be created on one that outlives them all.
static DB_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("failed to build test db runtime")
});

pub async fn setup_db() -> Result<MutexGuard<'static, ()>, DbError> {
    let guard = TEST_LOCK.lock().await;
    DB_RUNTIME
        .spawn(db::init(DbConfig::memory()))
        .await
        .expect("db init task panicked")?;
    db::get_db()?
        .query("DELETE queue_job; DELETE sequence;")
        .await?;
    Ok(guard)
}

/// Poll the store until the job reaches `state`.
pub async fn wait_for_state(id: JobId, state: JobState) -> Result<Job, DbError> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = JobRepository::get(id).await?;
        if job.state == state || tokio::time::Instant::now() >= deadline {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
