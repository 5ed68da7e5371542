#![allow(clippy::disallowed_methods)]

use std::error::Error;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use actors::{HttpDispatcher, JobExecutor};
use api::{AppState, demo_handlers, router};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use db::DbConfig;
use db::repositories::JobRepository;
use http_body_util::BodyExt;
use queue_core::{ChannelId, ChannelJob, Job, JobState};
use serde_json::{Value, json};
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tower::ServiceExt;

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

async fn setup() -> Result<(MutexGuard<'static, ()>, AppState), Box<dyn Error>> {
    let guard = TEST_LOCK.lock().await;
    DB_RUNTIME
        .spawn(db::init(DbConfig::memory()))
        .await
        .expect("db init task panicked")?;
    db::get_db()?
        .query("DELETE queue_job; DELETE sequence;")
        .await?;

    let (events, _) = broadcast::channel(16);
    let state = AppState {
        executor: Arc::new(JobExecutor::new(Arc::new(demo_handlers()))),
        runner: None,
        events,
        db_name: "main".to_string(),
    };
    Ok((guard, state))
}

async fn send(state: &AppState, request: Request<Body>) -> Result<(StatusCode, Value), Box<dyn Error>> {
    let response = router(state.clone()).oneshot(request).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, body))
}

fn get(uri: &str) -> Result<Request<Body>, Box<dyn Error>> {
    Ok(Request::builder().uri(uri).body(Body::empty())?)
}

fn post_json(uri: &str, body: Value) -> Result<Request<Body>, Box<dyn Error>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))?)
}

#[tokio::test]
async fn test_enqueue_and_read_back() -> Result<(), Box<dyn Error>> {
    let (_guard, state) = setup().await?;

    let (status, body) = send(
        &state,
        post_json(
            "/queue_job/enqueue",
            json!({
                "func": "demo.echo",
                "args": [1, 2, 3],
                "channel": "root.demo",
                "priority": 5,
                "identity_key": "echo-123",
            }),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["func"], "demo.echo");
    assert_eq!(body["channel"], "root.demo");
    assert_eq!(body["state"], "pending");
    let uuid = body["uuid"].as_str().ok_or("uuid missing")?.to_string();

    let (status, body) = send(&state, get(&format!("/queue_job/jobs/{}", uuid))?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["priority"], 5);

    let (status, body) = send(&state, get("/queue_job/jobs?state=pending")?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    let (status, _) = send(&state, get("/queue_job/jobs/not-a-ulid")?).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&state, get(&format!("/queue_job/jobs/{}", queue_core::JobId::new()))?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_enqueue_rejects_unknown_function() -> Result<(), Box<dyn Error>> {
    let (_guard, state) = setup().await?;

    let (status, body) = send(
        &state,
        post_json("/queue_job/enqueue", json!({ "func": "os.system", "args": ["ls"] }))?,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some_and(|e| e.contains("os.system")));
    assert!(JobRepository::select_not_done().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_runjob_executes_enqueued_job() -> Result<(), Box<dyn Error>> {
    let (_guard, state) = setup().await?;

    let job = JobRepository::create(&Job::new("demo.echo", json!(["a", "b"]))).await?;

    // not enqueued yet
    let uri = format!("/queue_job/runjob?db=main&job_uuid={}", job.id);
    let (status, body) = send(&state, get(&uri)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "skipped");

    JobRepository::set_enqueued(job.id, chrono::Utc::now()).await?;
    let (status, body) = send(&state, get(&uri)?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "done");

    let job = JobRepository::get(job.id).await?;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.result.as_deref(), Some("echoed 2 arguments"));

    let (status, _) = send(
        &state,
        get(&format!("/queue_job/runjob?db=other&job_uuid={}", job.id))?,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn test_requeue_and_health() -> Result<(), Box<dyn Error>> {
    let (_guard, state) = setup().await?;

    let mut job = JobRepository::create(&Job::new("demo.echo", json!([]))).await?;
    job.set_failed("boom");
    JobRepository::update(&job).await?;

    let (status, body) = send(&state, get("/health")?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["jobs"]["failed"], 1);

    let (status, body) = send(
        &state,
        post_json("/queue_job/requeue", json!({ "ids": [job.id.to_string()] }))?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requeued"], 1);
    assert_eq!(JobRepository::get(job.id).await?.state, JobState::Pending);

    // no runner in this process
    let (status, _) = send(&state, get("/queue_job/channels")?).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    Ok(())
}

#[tokio::test]
async fn test_runjob_outlives_dispatch_timeout() -> Result<(), Box<dyn Error>> {
    let (_guard, state) = setup().await?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move { axum::serve(listener, router(state)).await });

    let job = JobRepository::create(&Job::new(
        "demo.sleep",
        json!({"kwargs": {"seconds": 2}}),
    ))
    .await?;
    JobRepository::set_enqueued(job.id, chrono::Utc::now()).await?;

    // the dispatcher hangs up long before the job is over
    let dispatcher =
        HttpDispatcher::with_timeout(format!("http://{}", addr), Duration::from_millis(300))?;
    dispatcher.dispatch(&ChannelJob {
        id: job.id,
        db_name: "main".to_string(),
        channel: ChannelId::ROOT,
        seq: job.seq,
        date_created: job.date_created,
        priority: job.priority,
        eta: None,
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    let job = loop {
        let job = JobRepository::get(job.id).await?;
        if job.state == JobState::Done || tokio::time::Instant::now() >= deadline {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.result.as_deref(), Some("Slept for 2 seconds"));

    server.abort();
    Ok(())
}

#[tokio::test]
async fn test_enqueue_rejects_out_of_range_retry_delay() -> Result<(), Box<dyn Error>> {
    let (_guard, state) = setup().await?;

    let (status, body) = send(
        &state,
        post_json(
            "/queue_job/enqueue",
            json!({
                "func": "demo.echo",
                "retry_pattern": [[0, 10_000_000_000_000u64]],
            }),
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some_and(|e| e.contains("Retry delays")));

    Ok(())
}
