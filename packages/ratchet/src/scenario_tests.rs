//! End-to-end scenarios across backends.
//!
//! Store-level scenarios run against every embedded backend; queue-level
//! scenarios drive the full loop (claim, execute, classify, events) over the
//! in-memory and SQLite stores. Postgres runs the same store contract behind
//! an `#[ignore]`d suite in its own module.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{JobError, JobErrorKind, QueueError};
use crate::events::JobEvent;
use crate::fingerprint::fingerprint;
use crate::job::{Job, JobHandler, JobOutcome, JobStatus};
use crate::limiter::ConcurrencyLimiter;
use crate::queue::{JobQueue, QueueOptions};
use crate::store::local::LocalJobStore;
use crate::store::memory::InMemoryJobStore;
use crate::store::sqlite::SqliteJobStore;
use crate::store::JobStore;

// =============================================================================
// Fixtures
// =============================================================================

/// Rewrites `input` to `output` in the `data` field, the way a model task
/// would turn a prompt into a result.
struct EchoHandler;

#[async_trait::async_trait]
impl JobHandler for EchoHandler {
    async fn execute(&self, job: &Job, _signal: CancellationToken) -> Result<Value, JobError> {
        let data = job.input.get("data").and_then(|v| v.as_str()).unwrap_or("");
        Ok(json!({ "result": data.replace("input", "output") }))
    }
}

/// Runs until the cancellation signal fires, then surfaces the abort.
struct NeverHandler;

#[async_trait::async_trait]
impl JobHandler for NeverHandler {
    async fn execute(&self, _job: &Job, signal: CancellationToken) -> Result<Value, JobError> {
        signal.cancelled().await;
        Err(JobError::aborted("abort signal observed"))
    }
}

/// Fails transiently a fixed number of times, then succeeds.
struct FlakyHandler {
    failures_left: AtomicU32,
}

#[async_trait::async_trait]
impl JobHandler for FlakyHandler {
    async fn execute(&self, _job: &Job, _signal: CancellationToken) -> Result<Value, JobError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(JobError::retryable("transient fault", Utc::now()))
        } else {
            Ok(json!({ "result": "recovered" }))
        }
    }
}

fn pending_job(task_type: &str, input: Value) -> Job {
    let mut job = Job::new(task_type, input.clone());
    job.queue_name = "scenario".to_string();
    job.fingerprint = fingerprint(&input);
    job
}

async fn sqlite_store(queue: &str) -> Arc<SqliteJobStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    SqliteJobStore::migrate(&pool).await.unwrap();
    Arc::new(SqliteJobStore::new(pool, queue))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ratchet=debug")
        .with_test_writer()
        .try_init();
}

fn queue_with(
    name: &str,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    max_concurrent: usize,
) -> Arc<JobQueue> {
    init_tracing();
    Arc::new(JobQueue::with_options(
        name,
        store,
        Arc::new(ConcurrencyLimiter::new(max_concurrent)),
        handler,
        QueueOptions {
            wait_duration: Duration::from_millis(10),
            ..QueueOptions::default()
        },
    ))
}

/// Poll until `check` passes or the deadline expires.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// Store-level scenarios (run on every embedded backend)
// =============================================================================

/// Basic add/claim/complete with memoized lookup.
async fn scenario_basic_add_complete(store: Arc<dyn JobStore>) {
    let input = json!({"data": "input1"});
    let id = store.add(pending_job("task1", input.clone())).await.unwrap();
    assert_eq!(store.size().await.unwrap(), 1);

    let claimed = store.next().await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, JobStatus::Processing);

    store
        .complete(
            id,
            JobOutcome::Completed {
                output: json!({"result": "success"}),
            },
        )
        .await
        .unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.output, Some(json!({"result": "success"})));

    assert_eq!(
        store.output_for_input("task1", &input).await.unwrap(),
        Some(json!({"result": "success"}))
    );
}

/// Jobs added in order with equal `run_after` come back in order.
async fn scenario_fifo_ordering(store: Arc<dyn JobStore>) {
    let a = pending_job("task1", json!({"data": "a"}));
    let mut b = pending_job("task1", json!({"data": "b"}));
    b.run_after = a.run_after;
    b.created_at = a.created_at + chrono::Duration::milliseconds(2);
    let (a_id, b_id) = (a.id, b.id);

    store.add(a).await.unwrap();
    store.add(b).await.unwrap();

    assert_eq!(store.next().await.unwrap().unwrap().id, a_id);
    assert_eq!(store.next().await.unwrap().unwrap().id, b_id);
}

#[tokio::test]
async fn s1_basic_add_complete_memory() {
    scenario_basic_add_complete(Arc::new(InMemoryJobStore::new("scenario"))).await;
}

#[tokio::test]
async fn s1_basic_add_complete_sqlite() {
    scenario_basic_add_complete(sqlite_store("scenario").await).await;
}

#[tokio::test]
async fn s1_basic_add_complete_local() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path().join("jobs.db")).unwrap();
    scenario_basic_add_complete(Arc::new(LocalJobStore::open(&db, "scenario").unwrap())).await;
}

#[tokio::test]
async fn s2_fifo_ordering_memory() {
    scenario_fifo_ordering(Arc::new(InMemoryJobStore::new("scenario"))).await;
}

#[tokio::test]
async fn s2_fifo_ordering_sqlite() {
    scenario_fifo_ordering(sqlite_store("scenario").await).await;
}

#[tokio::test]
async fn s2_fifo_ordering_local() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path().join("jobs.db")).unwrap();
    scenario_fifo_ordering(Arc::new(LocalJobStore::open(&db, "scenario").unwrap())).await;
}

// =============================================================================
// Queue-level scenarios
// =============================================================================

/// Start, drain a small batch, stop; the last job carries the transformed
/// output.
async fn scenario_drain(store: Arc<dyn JobStore>) {
    let queue = queue_with("scenario", store, Arc::new(EchoHandler), 2);

    let mut last_id = Uuid::nil();
    for (task_type, data) in [
        ("task1", "input1"),
        ("task2", "input2"),
        ("task1", "input1"),
        ("task2", "input2"),
    ] {
        last_id = queue
            .add(Job::new(task_type, json!({ "data": data })))
            .await
            .unwrap();
    }

    queue.start().await;
    let output = queue.wait_for(last_id).await.unwrap();
    queue.stop().await;

    assert_eq!(output, json!({"result": "output2"}));
    let job = queue.store().get(last_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn s3_drain_memory() {
    scenario_drain(Arc::new(InMemoryJobStore::new("scenario"))).await;
}

#[tokio::test]
async fn s3_drain_sqlite() {
    scenario_drain(sqlite_store("scenario").await).await;
}

#[tokio::test]
async fn s4_rate_limited_jobs_stay_pending() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new("scenario"));
    // Four starts per window; the window is far longer than the test so the
    // fifth and sixth jobs cannot sneak in on a slow machine.
    let limiter =
        Arc::new(ConcurrencyLimiter::new(10).with_window(4, Duration::from_secs(60)));
    let queue = Arc::new(JobQueue::with_options(
        "scenario",
        store.clone(),
        limiter,
        Arc::new(EchoHandler),
        QueueOptions {
            wait_duration: Duration::from_millis(10),
            ..QueueOptions::default()
        },
    ));

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(
            queue
                .add(Job::new("task1", json!({ "data": format!("input{i}") })))
                .await
                .unwrap(),
        );
    }

    queue.start().await;
    // Give the window time to admit its four starts but stop well before it
    // slides.
    eventually("four jobs to finish", || async {
        let mut done = 0;
        for id in &ids {
            let job = store.get(*id).await.unwrap().unwrap();
            if job.status == JobStatus::Completed {
                done += 1;
            }
        }
        done >= 4
    })
    .await;
    queue.stop().await;

    let mut pending = 0;
    for id in &ids {
        let job = store.get(*id).await.unwrap().unwrap();
        if job.status == JobStatus::Pending {
            pending += 1;
        }
    }
    assert!(pending >= 1, "expected rate-limited jobs to remain pending");
}

#[tokio::test]
async fn s5_abort_in_flight_job() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new("scenario"));
    let queue = queue_with("scenario", store.clone(), Arc::new(NeverHandler), 2);

    let id = queue
        .add(Job::new("task1", json!({"data": "input1"})))
        .await
        .unwrap();

    queue.start().await;
    eventually("job to be claimed", || async {
        store.get(id).await.unwrap().unwrap().status == JobStatus::Processing
    })
    .await;

    let mut events = queue.subscribe();
    queue.abort(id).await.unwrap();

    let err = queue.wait_for(id).await.unwrap_err();
    match err {
        QueueError::JobFailed { kind, .. } => assert_eq!(kind, JobErrorKind::Abort),
        other => panic!("expected abort failure, got {other:?}"),
    }

    let mut saw_aborting = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, JobEvent::JobAborting { job_id, .. } if job_id == id) {
            saw_aborting = true;
        }
    }
    assert!(saw_aborting, "expected a job_aborting event for {id}");

    queue.stop().await;
}

#[tokio::test]
async fn s6_abort_by_job_run() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new("scenario"));
    let queue = queue_with("scenario", store.clone(), Arc::new(NeverHandler), 4);

    let r1 = Uuid::new_v4();
    let r2 = Uuid::new_v4();
    let mut ids = Vec::new();
    for run in [r1, r1, r2, r2] {
        let job = Job::builder()
            .task_type("task1".to_string())
            .input(json!({"data": "input"}))
            .job_run_id(run)
            .build();
        ids.push(queue.add(job).await.unwrap());
    }

    queue.start().await;
    eventually("all four jobs to be claimed", || async {
        store.processing().await.unwrap().len() == 4
    })
    .await;

    let aborted = queue.abort_job_run(r1).await.unwrap();
    assert_eq!(aborted, 2);

    eventually("run r1 to settle", || async {
        let j1 = store.get(ids[0]).await.unwrap().unwrap();
        let j2 = store.get(ids[1]).await.unwrap().unwrap();
        j1.status == JobStatus::Failed && j2.status == JobStatus::Failed
    })
    .await;

    assert_eq!(
        store.get(ids[2]).await.unwrap().unwrap().status,
        JobStatus::Processing
    );
    assert_eq!(
        store.get(ids[3]).await.unwrap().unwrap().status,
        JobStatus::Processing
    );

    queue.stop().await;
}

#[tokio::test]
async fn retryable_failure_requeues_then_recovers() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new("scenario"));
    let handler = Arc::new(FlakyHandler {
        failures_left: AtomicU32::new(1),
    });
    let queue = queue_with("scenario", store.clone(), handler, 1);
    let mut events = queue.subscribe();

    let id = queue
        .add(Job::new("task1", json!({"data": "input1"})))
        .await
        .unwrap();

    queue.start().await;
    let output = queue.wait_for(id).await.unwrap();
    queue.stop().await;

    assert_eq!(output, json!({"result": "recovered"}));
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.retries, 1);

    let mut saw_retry = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, JobEvent::JobRetry { job_id, .. } if job_id == id) {
            saw_retry = true;
        }
    }
    assert!(saw_retry, "expected a job_retry event");
}

#[tokio::test]
async fn permanent_failure_does_not_retry() {
    struct AlwaysFails;

    #[async_trait::async_trait]
    impl JobHandler for AlwaysFails {
        async fn execute(&self, _job: &Job, _signal: CancellationToken) -> Result<Value, JobError> {
            Err(JobError::permanent("bad input"))
        }
    }

    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new("scenario"));
    let queue = queue_with("scenario", store.clone(), Arc::new(AlwaysFails), 1);

    let id = queue
        .add(Job::new("task1", json!({"data": "input1"})))
        .await
        .unwrap();

    queue.start().await;
    let err = queue.wait_for(id).await.unwrap_err();
    queue.stop().await;

    match err {
        QueueError::JobFailed { kind, message, .. } => {
            assert_eq!(kind, JobErrorKind::Permanent);
            assert_eq!(message, "bad input");
        }
        other => panic!("expected permanent failure, got {other:?}"),
    }
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.retries, 0);
}

#[tokio::test]
async fn deadline_triggers_the_abort_path() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new("scenario"));
    let queue = queue_with("scenario", store.clone(), Arc::new(NeverHandler), 1);

    let job = Job::builder()
        .task_type("task1".to_string())
        .input(json!({"data": "input1"}))
        .deadline_at(Utc::now() + chrono::Duration::milliseconds(50))
        .build();
    let id = queue.add(job).await.unwrap();

    queue.start().await;
    let err = queue.wait_for(id).await.unwrap_err();
    queue.stop().await;

    match err {
        QueueError::JobFailed { kind, .. } => assert_eq!(kind, JobErrorKind::Abort),
        other => panic!("expected abort failure, got {other:?}"),
    }
}

#[tokio::test]
async fn memoized_admission_skips_known_inputs() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new("scenario"));
    let queue = Arc::new(JobQueue::with_options(
        "scenario",
        store.clone(),
        Arc::new(ConcurrencyLimiter::new(2)),
        Arc::new(EchoHandler),
        QueueOptions {
            wait_duration: Duration::from_millis(10),
            memoize: true,
            ..QueueOptions::default()
        },
    ));

    let first = queue
        .add(Job::new("task1", json!({"data": "input1"})))
        .await
        .unwrap();
    queue.start().await;
    queue.wait_for(first).await.unwrap();
    queue.stop().await;

    // Same (task_type, input): admitted as skipped with the memoized output.
    let second = queue
        .add(Job::new("task1", json!({"data": "input1"})))
        .await
        .unwrap();
    let job = store.get(second).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Skipped);
    assert_eq!(queue.wait_for(second).await.unwrap(), json!({"result": "output1"}));
}

#[tokio::test]
async fn wait_for_resolves_already_terminal_jobs() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new("scenario"));
    let queue = queue_with("scenario", store.clone(), Arc::new(EchoHandler), 1);

    let id = queue
        .add(Job::new("task1", json!({"data": "input1"})))
        .await
        .unwrap();
    queue.start().await;
    queue.wait_for(id).await.unwrap();
    queue.stop().await;

    // A second waiter sees the persisted result without any events flowing.
    assert_eq!(
        queue.wait_for(id).await.unwrap(),
        json!({"result": "output1"})
    );
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new("scenario"));
    let queue = queue_with("scenario", store, Arc::new(EchoHandler), 1);

    queue.start().await;
    queue.start().await;
    assert!(queue.is_running().await);

    queue.stop().await;
    queue.stop().await;
    assert!(!queue.is_running().await);

    // Restartable after a stop.
    queue.start().await;
    assert!(queue.is_running().await);
    queue.stop().await;
}
