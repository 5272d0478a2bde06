//! The job queue orchestrator.
//!
//! One cooperative scheduling loop per queue:
//!
//! ```text
//! JobQueue
//!     │
//!     ├─► RateLimiter.can_proceed()  (sleep until next_available_time if not)
//!     ├─► JobStore.next()            (atomic claim, PENDING → PROCESSING)
//!     ├─► AbortRegistry.register()   (child token of the queue shutdown token)
//!     ├─► spawn JobHandler.execute(job, signal)
//!     └─► classify → JobStore.complete() → emit events
//! ```
//!
//! Within a queue, up to `max_concurrent` jobs (per the limiter) execute in
//! parallel on their own tasks, tracked so `stop()` can drain them. Errors
//! from `execute` are captured and classified; they never unwind the loop.
//! Errors from the store during loop bookkeeping are logged and the loop
//! backs off; they never cause a silent state transition.
//!
//! Cancellation is cooperative: `abort` persists `ABORTING` and fires the
//! in-process handle. A job that ignores the signal runs to completion and
//! its return value decides the terminal state, except that a success
//! arriving while the row says `ABORTING` still lands in `COMPLETED`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::abort::AbortRegistry;
use crate::error::{JobErrorKind, QueueError, StoreError};
use crate::events::{EventBus, JobEvent};
use crate::fingerprint::fingerprint;
use crate::job::{Job, JobHandler, JobOutcome, JobStatus};
use crate::limiter::RateLimiter;
use crate::store::JobStore;

/// Tuning knobs for a queue.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Polling granularity of the scheduling loop.
    pub wait_duration: Duration,
    /// How long `stop()` waits for in-flight jobs to observe cancellation.
    pub stop_timeout: Duration,
    /// When enabled, `add` consults `output_for_input` and admits jobs with
    /// a known result as `SKIPPED`, carrying the memoized output.
    pub memoize: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            wait_duration: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(30),
            memoize: false,
        }
    }
}

struct LoopHandle {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    join: tokio::task::JoinHandle<()>,
}

/// Shared state the scheduling loop and in-flight jobs hold on to.
struct QueueCore {
    name: String,
    store: Arc<dyn JobStore>,
    limiter: Arc<dyn RateLimiter>,
    handler: Arc<dyn JobHandler>,
    events: EventBus,
    aborts: AbortRegistry,
    options: QueueOptions,
}

/// A named scheduling domain pairing a store, a limiter, and a loop.
pub struct JobQueue {
    core: Arc<QueueCore>,
    runtime: tokio::sync::Mutex<Option<LoopHandle>>,
}

impl JobQueue {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        limiter: Arc<dyn RateLimiter>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self::with_options(name, store, limiter, handler, QueueOptions::default())
    }

    pub fn with_options(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        limiter: Arc<dyn RateLimiter>,
        handler: Arc<dyn JobHandler>,
        options: QueueOptions,
    ) -> Self {
        Self {
            core: Arc::new(QueueCore {
                name: name.into(),
                store,
                limiter,
                handler,
                events: EventBus::new(),
                aborts: AbortRegistry::new(),
                options,
            }),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.core.store
    }

    /// Subscribe to lifecycle events for this queue.
    ///
    /// Handlers run on the subscriber's own task; emission never blocks the
    /// scheduling loop.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.core.events.subscribe()
    }

    /// Accept a job: assign identity and fingerprint, persist as `PENDING`,
    /// emit `job_added`. Producers are never blocked; backpressure shows up
    /// as a growing `size()`.
    pub async fn add(&self, mut job: Job) -> Result<Uuid, QueueError> {
        let core = &self.core;
        if job.id.is_nil() {
            job.id = Uuid::new_v4();
        }
        if job.job_run_id.is_none() {
            job.job_run_id = Some(Uuid::new_v4());
        }
        job.queue_name = core.name.clone();
        job.fingerprint = fingerprint(&job.input);
        job.status = JobStatus::Pending;

        if core.options.memoize {
            if let Some(output) = core
                .store
                .output_for_input(&job.task_type, &job.input)
                .await?
            {
                let id = job.id;
                job.status = JobStatus::Skipped;
                job.output = Some(output.clone());
                core.store.add(job).await?;
                debug!(queue = %core.name, job_id = %id, "admitted with memoized output");
                core.events.emit(JobEvent::JobSkipped {
                    queue: core.name.clone(),
                    job_id: id,
                    output,
                });
                return Ok(id);
            }
        }

        let task_type = job.task_type.clone();
        let id = core.store.add(job).await?;
        core.events.emit(JobEvent::JobAdded {
            queue: core.name.clone(),
            job_id: id,
            task_type,
        });
        Ok(id)
    }

    /// Launch the scheduling loop. Idempotent: a running queue stays as is.
    pub async fn start(&self) {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let core = Arc::clone(&self.core);
        let loop_shutdown = shutdown.clone();
        let loop_tracker = tracker.clone();
        let join = tokio::spawn(async move {
            core.run_loop(loop_shutdown, loop_tracker).await;
        });

        *runtime = Some(LoopHandle {
            shutdown,
            tracker,
            join,
        });
        info!(queue = %self.core.name, "queue started");
        self.core.events.emit(JobEvent::QueueStart {
            queue: self.core.name.clone(),
        });
    }

    /// Signal the loop to exit, cancel in-flight handles, and wait (bounded
    /// by `stop_timeout`) for jobs to observe cancellation or complete.
    /// Idempotent: stopping a stopped queue returns immediately.
    pub async fn stop(&self) {
        let handle = {
            let mut runtime = self.runtime.lock().await;
            runtime.take()
        };
        let Some(handle) = handle else {
            return;
        };

        handle.shutdown.cancel();
        if handle.join.await.is_err() {
            error!(queue = %self.core.name, "scheduling loop panicked");
        }

        handle.tracker.close();
        if tokio::time::timeout(self.core.options.stop_timeout, handle.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                queue = %self.core.name,
                "stop timed out waiting for in-flight jobs; they keep running detached"
            );
        }

        info!(queue = %self.core.name, "queue stopped");
        self.core.events.emit(JobEvent::QueueStop {
            queue: self.core.name.clone(),
        });
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    /// Request cancellation of one job.
    ///
    /// The persisted status moves to `ABORTING` (or straight to `FAILED` for
    /// a job that never started) and the in-process handle fires if the job
    /// is local. Cross-process abort requires re-issuing against the owning
    /// process.
    pub async fn abort(&self, id: Uuid) -> Result<Job, QueueError> {
        self.core.abort(id).await
    }

    /// Abort every `PENDING` or `PROCESSING` job sharing `job_run_id`.
    /// Returns how many abort requests were issued.
    pub async fn abort_job_run(&self, run_id: Uuid) -> Result<usize, QueueError> {
        let core = &self.core;
        let jobs = core.store.jobs_by_run_id(run_id).await?;
        let mut aborted = 0;
        for job in jobs {
            if matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
                match core.abort(job.id).await {
                    Ok(_) => aborted += 1,
                    Err(e) => {
                        warn!(queue = %core.name, job_id = %job.id, error = %e, "abort failed");
                    }
                }
            }
        }
        Ok(aborted)
    }

    /// Resolve when the job reaches `COMPLETED` (or `SKIPPED`), with its
    /// output; fail when it reaches `FAILED`, with the persisted error kind.
    pub async fn wait_for(&self, id: Uuid) -> Result<Value, QueueError> {
        // Subscribe before the snapshot so no terminal event can slip past.
        let mut receiver = self.core.events.subscribe();

        if let Some(result) = self.terminal_result(id).await? {
            return result;
        }

        loop {
            match receiver.recv().await {
                Ok(event) if event.job_id() == Some(id) => match event {
                    JobEvent::JobComplete { output, .. } => return Ok(output),
                    JobEvent::JobSkipped { output, .. } => return Ok(output),
                    JobEvent::JobError { kind, message, .. } => {
                        return Err(QueueError::JobFailed { id, kind, message });
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(queue = %self.core.name, job_id = %id, missed, "waiter lagged; re-reading store");
                    if let Some(result) = self.terminal_result(id).await? {
                        return result;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // The bus lives in the queue; reaching this means the
                    // queue is being torn down. Fall back to the store.
                    return match self.terminal_result(id).await? {
                        Some(result) => result,
                        None => Err(QueueError::Store(StoreError::NotFound(id))),
                    };
                }
            }
        }
    }

    /// Memoized result lookup against this queue's store.
    pub async fn output_for_input(
        &self,
        task_type: &str,
        input: &Value,
    ) -> Result<Option<Value>, QueueError> {
        Ok(self.core.store.output_for_input(task_type, input).await?)
    }

    /// Number of jobs held for this queue, any status.
    pub async fn size(&self) -> Result<u64, QueueError> {
        Ok(self.core.store.size().await?)
    }

    async fn terminal_result(
        &self,
        id: Uuid,
    ) -> Result<Option<Result<Value, QueueError>>, QueueError> {
        let Some(job) = self.core.store.get(id).await? else {
            return Err(QueueError::Store(StoreError::NotFound(id)));
        };
        Ok(match job.status {
            JobStatus::Completed | JobStatus::Skipped => {
                Some(Ok(job.output.unwrap_or(Value::Null)))
            }
            JobStatus::Failed => Some(Err(QueueError::JobFailed {
                id,
                kind: job.error_kind.unwrap_or(JobErrorKind::Permanent),
                message: job.error.unwrap_or_default(),
            })),
            _ => None,
        })
    }
}

impl QueueCore {
    async fn abort(&self, id: Uuid) -> Result<Job, QueueError> {
        let job = self.store.abort(id).await?;
        match job.status {
            JobStatus::Aborting => {
                self.events.emit(JobEvent::JobAborting {
                    queue: self.name.clone(),
                    job_id: id,
                });
                self.aborts.cancel(id);
            }
            JobStatus::Failed if job.error_kind == Some(JobErrorKind::Abort) => {
                // Aborted before it ever started; surface the full causal pair.
                self.events.emit(JobEvent::JobAborting {
                    queue: self.name.clone(),
                    job_id: id,
                });
                self.events.emit(JobEvent::JobError {
                    queue: self.name.clone(),
                    job_id: id,
                    kind: JobErrorKind::Abort,
                    message: job.error.clone().unwrap_or_default(),
                });
            }
            _ => {}
        }
        Ok(job)
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken, tracker: TaskTracker) {
        debug!(queue = %self.name, "scheduling loop running");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.limiter.can_proceed().await {
                Ok(true) => {}
                Ok(false) => {
                    let sleep = match self.limiter.next_available_time().await {
                        Ok(next) => {
                            let until =
                                (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                            if until.is_zero() {
                                self.options.wait_duration
                            } else {
                                until.min(self.options.wait_duration)
                            }
                        }
                        Err(e) => {
                            warn!(queue = %self.name, error = %e, "limiter lookup failed");
                            self.options.wait_duration
                        }
                    };
                    sleep_or_shutdown(&shutdown, sleep).await;
                    continue;
                }
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "limiter check failed");
                    sleep_or_shutdown(&shutdown, self.options.wait_duration).await;
                    continue;
                }
            }

            let job = match self.store.next().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    sleep_or_shutdown(&shutdown, self.options.wait_duration).await;
                    continue;
                }
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "claim failed; backing off");
                    sleep_or_shutdown(&shutdown, self.options.wait_duration).await;
                    continue;
                }
            };

            if let Err(e) = self.limiter.record_job_start().await {
                warn!(queue = %self.name, job_id = %job.id, error = %e, "failed to record start");
            }
            let signal = self.aborts.register(job.id, &shutdown);
            debug!(queue = %self.name, job_id = %job.id, task_type = %job.task_type, "job claimed");
            self.events.emit(JobEvent::JobStart {
                queue: self.name.clone(),
                job_id: job.id,
                task_type: job.task_type.clone(),
            });

            let core = Arc::clone(&self);
            tracker.spawn(core.run_job(job, signal));
        }
        debug!(queue = %self.name, "scheduling loop exited");
    }

    async fn run_job(self: Arc<Self>, job: Job, signal: CancellationToken) {
        let id = job.id;

        // The deadline rides the same cancellation path as an external abort.
        let watchdog = job.deadline_at.map(|deadline| {
            let core = Arc::clone(&self);
            let signal = signal.clone();
            tokio::spawn(async move {
                let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = signal.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        debug!(queue = %core.name, job_id = %id, "deadline reached");
                        if let Err(e) = core.abort(id).await {
                            warn!(queue = %core.name, job_id = %id, error = %e, "deadline abort failed");
                        }
                    }
                }
            })
        });

        let result = self.handler.execute(&job, signal.clone()).await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let outcome = match result {
            Ok(output) => JobOutcome::Completed { output },
            Err(err) => JobOutcome::from(err),
        };

        match self.store.complete(id, outcome).await {
            Ok(updated) => match updated.status {
                JobStatus::Completed => {
                    debug!(queue = %self.name, job_id = %id, "job completed");
                    self.events.emit(JobEvent::JobComplete {
                        queue: self.name.clone(),
                        job_id: id,
                        status: updated.status,
                        output: updated.output.unwrap_or(Value::Null),
                    });
                }
                JobStatus::Pending => {
                    debug!(
                        queue = %self.name,
                        job_id = %id,
                        retries = updated.retries,
                        run_after = %updated.run_after,
                        "job re-queued"
                    );
                    self.events.emit(JobEvent::JobRetry {
                        queue: self.name.clone(),
                        job_id: id,
                        retries: updated.retries,
                        run_after: updated.run_after,
                    });
                }
                JobStatus::Failed => {
                    let kind = updated.error_kind.unwrap_or(JobErrorKind::Permanent);
                    let message = updated.error.unwrap_or_default();
                    warn!(queue = %self.name, job_id = %id, kind = %kind, error = %message, "job failed");
                    self.events.emit(JobEvent::JobError {
                        queue: self.name.clone(),
                        job_id: id,
                        kind,
                        message,
                    });
                }
                other => {
                    warn!(queue = %self.name, job_id = %id, status = %other, "unexpected post-completion status");
                }
            },
            Err(e) => {
                error!(queue = %self.name, job_id = %id, error = %e, "failed to record job outcome");
            }
        }

        self.aborts.remove(id);
        if let Err(e) = self.limiter.record_job_completion().await {
            warn!(queue = %self.name, job_id = %id, error = %e, "failed to record completion");
        }
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.core.name)
            .field("options", &self.core.options)
            .finish()
    }
}

async fn sleep_or_shutdown(shutdown: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
