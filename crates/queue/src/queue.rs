//! The worker-pool orchestrator: polls storage for due jobs, dispatches
//! them to registered handlers (wrapped in the configured middleware
//! chain) bounded by a concurrency limit, and runs a background
//! stale-lease recovery sweep alongside it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use signalq_core::options::{apply_options, OptionFn};
use signalq_core::{Error, Result};

use crate::handler::HandlerRegistry;
use crate::job::{Job, JobId};
use crate::middleware::{self, Middleware};
use crate::storage::{QueueStats, Storage};

/// Configuration for a [`Queue`], built via its option list.
pub struct QueueConfig {
    /// Upper bound on jobs executing at once.
    pub concurrency: usize,
    /// How long to sleep between `fetch_due` polls when nothing was due.
    pub poll_interval: Duration,
    /// How long a `Running` job can go without completing before
    /// `clean_stale` considers its lease abandoned.
    pub lease_timeout: Duration,
    /// How often the stale-lease sweep runs.
    pub stale_check_interval: Duration,
    /// Bound on a single handler call; a handler that runs longer than
    /// this fails the attempt rather than occupying its worker slot
    /// indefinitely.
    pub job_timeout: Duration,
    /// How long `stop` waits for in-flight jobs to finish before giving up
    /// on them and returning anyway.
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval: Duration::from_millis(100),
            lease_timeout: Duration::from_secs(30),
            stale_check_interval: Duration::from_secs(10),
            job_timeout: Duration::from_secs(30 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

pub fn with_concurrency(n: usize) -> OptionFn<QueueConfig> {
    Box::new(move |c| c.concurrency = n)
}

pub fn with_poll_interval(d: Duration) -> OptionFn<QueueConfig> {
    Box::new(move |c| c.poll_interval = d)
}

pub fn with_lease_timeout(d: Duration) -> OptionFn<QueueConfig> {
    Box::new(move |c| c.lease_timeout = d)
}

pub fn with_stale_check_interval(d: Duration) -> OptionFn<QueueConfig> {
    Box::new(move |c| c.stale_check_interval = d)
}

pub fn with_job_timeout(d: Duration) -> OptionFn<QueueConfig> {
    Box::new(move |c| c.job_timeout = d)
}

pub fn with_shutdown_timeout(d: Duration) -> OptionFn<QueueConfig> {
    Box::new(move |c| c.shutdown_timeout = d)
}

/// A concurrent job queue over a pluggable [`Storage`] backend.
///
/// Register handlers and middleware before wrapping the queue in an `Arc`
/// and calling [`Queue::run`]; `run` takes `Arc<Self>` because the worker
/// pool it spawns needs to outlive the call that started it.
pub struct Queue<S> {
    storage: Arc<S>,
    registry: HandlerRegistry,
    middlewares: Vec<Middleware>,
    config: QueueConfig,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
    closed: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    in_flight: Mutex<JoinSet<()>>,
}

impl<S: Storage + 'static> Queue<S> {
    pub fn new(storage: Arc<S>, opts: Vec<OptionFn<QueueConfig>>) -> Self {
        let config = apply_options(opts);
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            storage,
            registry: HandlerRegistry::new(),
            middlewares: Vec::new(),
            config,
            semaphore,
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: Mutex::new(None),
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    /// Register a handler for `task`, decoding each job's payload as `T`.
    pub fn register<T, F, Fut>(&mut self, task: impl Into<String>, func: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.register(task, func);
    }

    /// Append a middleware to the chain wrapping every handler invocation.
    /// Call order follows registration order: the first middleware
    /// registered is outermost.
    pub fn use_middleware(&mut self, mw: Middleware) {
        self.middlewares.push(mw);
    }

    pub async fn enqueue(&self, job: Job) -> Result<JobId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::QueueClosed);
        }
        self.storage.enqueue(job).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.storage.stats().await
    }

    /// Stop accepting new `enqueue` calls. Does not interrupt in-flight
    /// jobs or stop an already-running `run` loop — pair with cancelling
    /// the token passed to `run`, or call `stop` for a full shutdown.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Signal the running worker pool to stop and wait for in-flight jobs
    /// to finish, up to `config.shutdown_timeout`. Fails with
    /// `QueueNotRunning` if `run` isn't currently active.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::QueueNotRunning);
        }
        self.closed.store(true, Ordering::Release);
        if let Some(cancel) = self.cancel.lock().await.as_ref() {
            cancel.cancel();
        }
        self.await_in_flight().await;
        Ok(())
    }

    /// Run the worker pool until `cancel` fires. Polls storage for due
    /// jobs, dispatches each to its handler bounded by `config.concurrency`
    /// concurrent executions, and runs a parallel stale-lease sweep.
    ///
    /// Returns `QueueAlreadyRunning` if called while a previous `run` on
    /// this queue hasn't returned yet.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::QueueAlreadyRunning);
        }
        *self.cancel.lock().await = Some(cancel.clone());

        let stale_sweep = tokio::spawn({
            let this = self.clone();
            let cancel = cancel.clone();
            async move { this.stale_recovery_loop(cancel).await }
        });

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let due = self.storage.fetch_due(self.config.concurrency).await?;
            if due.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            for job in due {
                let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                    break;
                };
                let this = self.clone();
                self.in_flight.lock().await.spawn(async move {
                    let _permit = permit;
                    this.execute(job).await;
                });
            }

            // Reap already-finished handles so the set doesn't grow
            // unbounded across a long-running queue.
            let mut in_flight = self.in_flight.lock().await;
            while in_flight.try_join_next().is_some() {}
        }

        let _ = stale_sweep.await;
        self.await_in_flight().await;
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Wait for every spawned job task to finish, bounded by
    /// `config.shutdown_timeout`.
    async fn await_in_flight(&self) {
        let mut in_flight = self.in_flight.lock().await;
        let remaining = in_flight.len();
        let wait = async {
            while in_flight.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_timeout, wait)
            .await
            .is_err()
        {
            warn!(
                jobs = remaining,
                "shutdown timeout elapsed with jobs still in flight"
            );
        }
    }

    async fn execute(&self, mut job: Job) {
        let Some(base) = self.registry.get(&job.task) else {
            warn!(task = %job.task, job_id = %job.id, "no handler registered for task");
            job.mark_failed(
                Error::HandlerNotFound(job.task.clone()).to_string(),
                Utc::now(),
            );
            let _ = self.storage.update(&job).await;
            return;
        };

        let handler = middleware::compose(base, &self.middlewares);
        let started = Utc::now();
        let outcome = tokio::time::timeout(self.config.job_timeout, handler.call(job.payload.clone())).await;
        match outcome {
            Ok(Ok(())) => job.mark_completed(started),
            Ok(Err(e)) => job.mark_failed(e.to_string(), started),
            Err(_) => job.mark_failed(
                format!("handler exceeded {:?} timeout", self.config.job_timeout),
                started,
            ),
        }
        if let Err(e) = self.storage.update(&job).await {
            error!(job_id = %job.id, error = %e, "failed to persist job outcome");
        }
    }

    async fn stale_recovery_loop(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.stale_check_interval) => {
                    if let Err(e) = self.storage.clean_stale(self.config.lease_timeout).await {
                        error!(error = %e, "stale-lease recovery failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    #[derive(Deserialize)]
    struct Ping;

    #[tokio::test]
    async fn run_executes_enqueued_jobs_and_stops_on_cancel() {
        let storage = Arc::new(MemoryStorage::new());
        let mut queue = Queue::new(storage.clone(), vec![with_poll_interval(StdDuration::from_millis(5))]);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        queue.register("ping", move |_: Ping| {
            let ran = ran_clone.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let queue = Arc::new(queue);
        queue
            .enqueue(Job::new("host", "ping", json!({})))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(queue.clone().run(run_cancel));

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn stop_without_a_running_queue_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = Queue::new(storage, vec![]);
        assert!(matches!(queue.stop().await, Err(Error::QueueNotRunning)));
    }

    #[tokio::test]
    async fn stop_waits_for_an_in_flight_job_to_finish() {
        let storage = Arc::new(MemoryStorage::new());
        let mut queue = Queue::new(
            storage.clone(),
            vec![
                with_poll_interval(StdDuration::from_millis(5)),
                with_shutdown_timeout(StdDuration::from_secs(1)),
            ],
        );

        let finished = Arc::new(AtomicBool::new(false));
        let finished_clone = finished.clone();
        queue.register("slow", move |_: Ping| {
            let finished = finished_clone.clone();
            async move {
                tokio::time::sleep(StdDuration::from_millis(40)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        let queue = Arc::new(queue);
        queue
            .enqueue(Job::new("host", "slow", json!({})))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(cancel));

        // Give the job time to be claimed and start running, then stop
        // before it would naturally finish.
        tokio::time::sleep(StdDuration::from_millis(15)).await;
        queue.stop().await.unwrap();
        handle.await.unwrap().unwrap();

        assert!(finished.load(Ordering::SeqCst), "stop returned before the in-flight job finished");
    }

    #[tokio::test]
    async fn job_exceeding_job_timeout_is_failed() {
        let storage = Arc::new(MemoryStorage::new());
        let mut queue = Queue::new(
            storage.clone(),
            vec![
                with_poll_interval(StdDuration::from_millis(5)),
                with_job_timeout(StdDuration::from_millis(10)),
            ],
        );
        queue.register("hangs", |_: Ping| async {
            tokio::time::sleep(StdDuration::from_secs(5)).await;
            Ok(())
        });

        let queue = Arc::new(queue);
        let id = queue
            .enqueue(Job::new("host", "hangs", json!({})).with_retry_policy(
                crate::retry::RetryPolicy::no_retry(),
            ))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(cancel.clone()));

        let deadline = tokio::time::Instant::now() + StdDuration::from_secs(2);
        loop {
            let job = storage.get(&id).await.unwrap().unwrap();
            if job.status.is_terminal() || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let job = storage.get(&id).await.unwrap().unwrap();
        assert!(matches!(job.status, crate::job::JobStatus::DeadLettered { .. }));
    }

    #[tokio::test]
    async fn second_concurrent_run_call_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = Arc::new(Queue::new(storage, vec![]));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(queue.clone().run(cancel.clone()));
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        let err = queue.clone().run(CancellationToken::new()).await;
        assert!(matches!(err, Err(Error::QueueAlreadyRunning)));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn enqueue_after_close_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = Queue::new(storage, vec![]);
        queue.close().await.unwrap();

        let err = queue.enqueue(Job::new("host", "ping", json!({}))).await;
        assert!(matches!(err, Err(Error::QueueClosed)));
    }

    #[tokio::test]
    async fn unknown_task_is_failed_not_panicked() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = Arc::new(Queue::new(
            storage.clone(),
            vec![with_poll_interval(StdDuration::from_millis(5))],
        ));
        queue
            .enqueue(Job::new("host", "missing", json!({})))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(cancel.clone()));
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let stats = queue.stats().await.unwrap();
        assert!(stats.failed + stats.dead_lettered >= 1);
    }

    mod proptest_tests {
        use super::*;
        use crate::job::JobStatus;
        use crate::retry::RetryPolicy;
        use proptest::prelude::*;
        use std::sync::atomic::AtomicU32;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 16,
                ..ProptestConfig::default()
            })]

            // For all jobs with a retry policy allowing `max_attempts` total
            // attempts whose handler fails deterministically, the handler is
            // invoked exactly `max_attempts` times and the terminal status is
            // dead-lettered with that many recorded attempts.
            #[test]
            fn deterministic_failure_exhausts_exactly_max_attempts(max_attempts in 1u32..5) {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async {
                    let storage = Arc::new(MemoryStorage::new());
                    let mut queue = Queue::new(
                        storage.clone(),
                        vec![with_poll_interval(StdDuration::from_millis(2))],
                    );

                    let calls = Arc::new(AtomicU32::new(0));
                    let calls_clone = calls.clone();
                    queue.register("always_fails", move |_: Ping| {
                        let calls = calls_clone.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err(Error::Other(anyhow::anyhow!("deterministic failure")))
                        }
                    });

                    let queue = Arc::new(queue);
                    let job = Job::new("host", "always_fails", json!({}))
                        .with_retry_policy(RetryPolicy::fixed(max_attempts, StdDuration::from_millis(1)));
                    let id = queue.enqueue(job).await.unwrap();

                    let cancel = CancellationToken::new();
                    let handle = tokio::spawn(queue.clone().run(cancel.clone()));

                    // Poll until the job reaches its terminal state or we give up.
                    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(2);
                    loop {
                        let job = storage.get(&id).await.unwrap().unwrap();
                        if job.status.is_terminal() || tokio::time::Instant::now() > deadline {
                            break;
                        }
                        tokio::time::sleep(StdDuration::from_millis(5)).await;
                    }
                    cancel.cancel();
                    handle.await.unwrap().unwrap();

                    let job = storage.get(&id).await.unwrap().unwrap();
                    prop_assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
                    prop_assert!(matches!(
                        job.status,
                        JobStatus::DeadLettered { attempts, .. } if attempts == max_attempts
                    ));
                    Ok(())
                })?;
            }
        }
    }
}
