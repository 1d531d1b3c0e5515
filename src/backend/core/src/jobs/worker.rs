//! Job worker pool.
//!
//! `num_workers` tasks share one driver. Each task pops a job, decodes it
//! through the registry, runs it with bounded retry, and acknowledges the
//! outcome back to the driver. A failing or panicking job only affects the
//! worker running it.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::driver::{QueueDriver, QueuedJob};
use super::job::{BackoffStrategy, Job, JobContext, JobError, JobResult};
use super::registry::JobRegistry;
use crate::error::{ErrorCode, Result};
use crate::telemetry::metrics::JobMetrics;

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent consumer tasks
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Worker name prefix used in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Delay between retry attempts of one job
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Per-attempt execution limit. Unset means a job may run forever.
    #[serde(default, with = "humantime_serde")]
    pub job_timeout: Option<Duration>,
    /// Pause after the driver fails to deliver a job
    #[serde(default = "default_error_backoff", with = "humantime_serde")]
    pub error_backoff: Duration,
    /// How long shutdown waits for in-flight jobs before aborting workers
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            name: default_name(),
            backoff: BackoffStrategy::default(),
            job_timeout: None,
            error_backoff: default_error_backoff(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl WorkerConfig {
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }
}

fn default_num_workers() -> usize {
    4
}

fn default_name() -> String {
    "jobqueue-worker".to_string()
}

fn default_error_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Counters shared by every task of a pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Jobs popped from the driver
    pub processed: Arc<AtomicU64>,
    /// Jobs acknowledged as finished
    pub finished: Arc<AtomicU64>,
    /// Jobs acknowledged as failed after exhausting retries
    pub failed: Arc<AtomicU64>,
    /// Payloads that could not be decoded
    pub rejected: Arc<AtomicU64>,
    /// Re-executions after a failed attempt
    pub retried: Arc<AtomicU64>,
    /// Jobs currently executing
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Jobs that reached a terminal acknowledgement.
    pub fn acknowledged(&self) -> u64 {
        self.finished() + self.failed() + self.rejected()
    }
}

/// Terminal state of one popped job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Succeeded after `attempts` executions
    Finished { attempts: u32 },
    /// Ran out of retries, or returned a fatal error
    Failed { attempts: u32, error: JobError },
    /// The payload never became a job
    Rejected { code: ErrorCode },
}

/// Pops, decodes, executes and acknowledges jobs.
pub struct JobWorker {
    driver: Arc<dyn QueueDriver>,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(
        driver: Arc<dyn QueueDriver>,
        registry: Arc<JobRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            driver,
            registry,
            config,
            stats: WorkerStats::new(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Spawn the consumer tasks and return a handle for controlling them.
    pub fn start(self) -> WorkerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let driver = self.driver.clone();
        let shutdown_timeout = self.config.shutdown_timeout;

        let num_workers = if self.config.num_workers == 0 {
            warn!(worker = %self.config.name, "num_workers is 0, starting a single worker");
            1
        } else {
            self.config.num_workers
        };

        info!(
            worker = %self.config.name,
            num_workers,
            driver = driver.name(),
            jobs = ?self.registry.names(),
            "Job workers starting"
        );

        let worker = Arc::new(self);
        let mut tasks = JoinSet::new();
        for index in 0..num_workers {
            let worker = worker.clone();
            let cancel = cancel_rx.clone();
            tasks.spawn(async move { worker.run_loop(index, cancel).await });
        }

        WorkerHandle {
            driver,
            cancel: cancel_tx,
            tasks,
            stats,
            shutdown_timeout,
        }
    }

    async fn run_loop(&self, index: usize, mut cancel: watch::Receiver<bool>) {
        let name = format!("{}-{}", self.config.name, index);
        debug!(worker = %name, "Worker started");

        loop {
            let next = tokio::select! {
                next = self.driver.next() => next,
                _ = cancelled(&mut cancel) => break,
            };

            match next {
                Ok(Some(queued)) => {
                    self.process(&name, queued).await;
                }
                Ok(None) => {
                    debug!(worker = %name, "Driver has no more work");
                    break;
                }
                Err(e) => {
                    // Not attributable to any job; back off and poll again.
                    e.log();
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                        _ = cancelled(&mut cancel) => break,
                    }
                }
            }
        }

        debug!(worker = %name, "Worker stopped");
    }

    /// Run one popped job to a terminal state and acknowledge it.
    pub async fn process(&self, worker: &str, queued: QueuedJob) -> JobOutcome {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        let _active = ActiveJob::enter(&self.stats.active);
        self.process_inner(worker, queued).await
    }

    async fn process_inner(&self, worker: &str, queued: QueuedJob) -> JobOutcome {
        let job = match self.registry.decode(&queued.payload) {
            Ok(job) => job,
            Err(e) => {
                error!(
                    job_id = %queued.id,
                    worker,
                    error_code = %e.code(),
                    error = %e,
                    "Rejecting job payload that could not be decoded"
                );
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                JobMetrics::rejected(&e.code().to_string());

                let code = e.code();
                if let Err(ack) = self.driver.failed(queued.id, &JobError::from(e)).await {
                    ack.log();
                }
                return JobOutcome::Rejected { code };
            }
        };

        let span = info_span!("job", job_id = %queued.id, job_name = %job.name(), worker);
        self.execute_with_retry(job.as_ref(), queued, worker)
            .instrument(span)
            .await
    }

    async fn execute_with_retry(&self, job: &dyn Job, queued: QueuedJob, worker: &str) -> JobOutcome {
        let timer = JobMetrics::start(job.name());
        let max_retry_count = job.max_retry_count();
        let mut ctx = JobContext::new(queued.id, job.name(), 0, max_retry_count, worker);

        loop {
            debug!(attempt = ctx.attempt(), "Executing job");

            let error = match self.run_attempt(job, &ctx).await {
                Ok(()) => {
                    let attempts = ctx.attempts_made();
                    debug!(attempts, "Job finished");
                    if let Err(ack) = self.driver.finished(queued.id).await {
                        ack.log();
                    }
                    self.stats.finished.fetch_add(1, Ordering::Relaxed);
                    timer.finish(true);
                    return JobOutcome::Finished { attempts };
                }
                Err(error) => error,
            };

            if error.retryable && ctx.attempt() < max_retry_count {
                warn!(attempt = ctx.attempt(), error = %error, "Job attempt failed, retrying");
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                JobMetrics::retried(job.name());

                let delay = self.config.backoff.delay_for_retry(ctx.attempt());
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                ctx = ctx.next_attempt();
                continue;
            }

            let attempts = ctx.attempts_made();
            error!(
                attempts,
                retryable = error.retryable,
                error = %error,
                "Job failed"
            );
            if let Err(ack) = self.driver.failed(queued.id, &error).await {
                ack.log();
            }
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            timer.finish(false);
            return JobOutcome::Failed { attempts, error };
        }
    }

    async fn run_attempt(&self, job: &dyn Job, ctx: &JobContext) -> JobResult {
        let attempt = AssertUnwindSafe(job.execute(ctx)).catch_unwind();

        let result = match self.config.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(JobError::retryable(format!(
                        "Job timed out after {:?}",
                        limit
                    ))
                    .with_code("TIMEOUT"))
                }
            },
            None => attempt.await,
        };

        result.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(JobError::retryable(format!("Job panicked: {}", message)).with_code("PANIC"))
        })
    }
}

/// Holds one slot of the `active` gauge; released on drop so an aborted
/// task does not leave the count raised.
struct ActiveJob<'a>(&'a AtomicU64);

impl<'a> ActiveJob<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Resolves once cancellation is requested. Never resolves if the sender
/// is gone without cancelling.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Handle for controlling a running worker pool.
pub struct WorkerHandle {
    driver: Arc<dyn QueueDriver>,
    cancel: watch::Sender<bool>,
    tasks: JoinSet<()>,
    stats: WorkerStats,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    /// Phase one of shutdown: the driver stops yielding jobs. Jobs already
    /// popped keep running to completion.
    pub async fn stop(&self) {
        self.driver.stop().await;
    }

    /// Make idle workers exit without waiting for the driver's sequence to
    /// end. A job that is executing is not interrupted.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Abort every worker task, including any job it is executing. Aborted
    /// jobs are never acknowledged.
    pub fn abort(&mut self) {
        self.tasks.abort_all();
    }

    /// Wait for every worker task to exit.
    pub async fn join(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Worker task panicked");
                }
            }
        }
    }

    /// Number of worker tasks still running.
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Two-phase shutdown: stop intake, let in-flight jobs finish (bounded by
    /// the shutdown timeout), then release the driver.
    pub async fn shutdown(mut self) -> Result<()> {
        info!(running = self.running(), "Shutting down job workers");
        self.stop().await;
        self.cancel();

        let timeout = self.shutdown_timeout;
        if tokio::time::timeout(timeout, self.join()).await.is_err() {
            error!(
                running = self.running(),
                timeout = ?timeout,
                "Workers did not drain in time, aborting"
            );
            self.abort();
            self.join().await;
        }

        self.driver.shutdown_gracefully().await?;
        info!(
            finished = self.stats.finished(),
            failed = self.stats.failed(),
            rejected = self.stats.rejected(),
            "Job workers shut down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::identifier::{JobIdentifier, JobParameters};
    use crate::jobs::job::{JobDefinition, JobId};
    use crate::jobs::memory::MemoryQueue;
    use crate::jobs::registry::JobEnvelope;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Flaky {
        fail_times: u32,
    }

    impl JobParameters for Flaky {
        const JOB_NAME: &'static str = "flaky";
    }

    fn flaky_worker(max_retry_count: u32, calls: Arc<AtomicU32>) -> (Arc<MemoryQueue>, JobWorker) {
        let mut registry = JobRegistry::new();
        registry
            .register(JobDefinition::new(
                JobIdentifier::<Flaky>::canonical(),
                max_retry_count,
                move |params: Flaky, ctx| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if ctx.attempt() < params.fail_times {
                            Err(JobError::retryable(format!("attempt {}", ctx.attempt())))
                        } else {
                            Ok(())
                        }
                    }
                },
            ))
            .unwrap();

        let queue = Arc::new(MemoryQueue::new());
        let worker = JobWorker::new(queue.clone(), Arc::new(registry), WorkerConfig::default());
        (queue, worker)
    }

    async fn explode(_params: Flaky, _ctx: JobContext) -> JobResult {
        panic!("kaboom")
    }

    async fn pop(queue: &MemoryQueue, fail_times: u32) -> QueuedJob {
        let payload =
            JobEnvelope::encode(&JobIdentifier::<Flaky>::canonical(), &Flaky { fail_times })
                .unwrap();
        queue.push(payload).await.unwrap();
        queue.next().await.unwrap().unwrap()
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.backoff, BackoffStrategy::Immediate);
        assert!(config.job_timeout.is_none());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_worker_config_deserialize() {
        let config: WorkerConfig = serde_json::from_str(
            r#"{"num_workers": 8, "job_timeout": "2s", "error_backoff": "250ms"}"#,
        )
        .unwrap();
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.job_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.error_backoff, Duration::from_millis(250));
        assert_eq!(config.name, "jobqueue-worker");
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);
        assert_eq!(stats.acknowledged(), 0);

        stats.finished.fetch_add(2, Ordering::Relaxed);
        stats.rejected.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.acknowledged(), 3);
    }

    #[tokio::test]
    async fn test_retry_then_finish() {
        let calls = Arc::new(AtomicU32::new(0));
        let (queue, worker) = flaky_worker(2, calls.clone());

        let queued = pop(&queue, 2).await;
        let outcome = worker.process("test", queued).await;

        assert_eq!(outcome, JobOutcome::Finished { attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.finished, stats.failed), (1, 0));
        assert_eq!(worker.stats().retried(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let (queue, worker) = flaky_worker(2, calls.clone());

        let queued = pop(&queue, 10).await;
        let outcome = worker.process("test", queued).await;

        assert_eq!(
            outcome,
            JobOutcome::Failed {
                attempts: 3,
                error: JobError::retryable("attempt 2"),
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error.message, "attempt 2");
        assert_eq!(queue.stats().await.unwrap().finished, 0);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let (queue, worker) = flaky_worker(0, calls.clone());

        let queued = pop(&queue, 1).await;
        let outcome = worker.process("test", queued).await;

        assert!(matches!(outcome, JobOutcome::Failed { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_rejected_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let (queue, worker) = flaky_worker(5, calls.clone());

        queue
            .push(br#"{"unknown-job": {}}"#.to_vec())
            .await
            .unwrap();
        let queued = queue.next().await.unwrap().unwrap();
        let outcome = worker.process("test", queued).await;

        assert_eq!(
            outcome,
            JobOutcome::Rejected {
                code: ErrorCode::UnrecognisedJobId
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(worker.stats().rejected(), 1);
        assert_eq!(worker.stats().retried(), 0);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_skips_remaining_retries() {
        let mut registry = JobRegistry::new();
        registry
            .register(JobDefinition::new(
                JobIdentifier::<Flaky>::canonical(),
                5,
                |_params: Flaky, _ctx| async { Err::<(), _>(JobError::fatal("invalid recipient")) },
            ))
            .unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let worker = JobWorker::new(queue.clone(), Arc::new(registry), WorkerConfig::default());

        let queued = pop(&queue, 0).await;
        let outcome = worker.process("test", queued).await;
        assert!(matches!(outcome, JobOutcome::Failed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_panicking_job_is_contained() {
        let mut registry = JobRegistry::new();
        registry
            .register(JobDefinition::new(
                JobIdentifier::<Flaky>::canonical(),
                1,
                explode,
            ))
            .unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let worker = JobWorker::new(queue.clone(), Arc::new(registry), WorkerConfig::default());

        let queued = pop(&queue, 0).await;
        match worker.process("test", queued).await {
            JobOutcome::Failed { attempts, error } => {
                assert_eq!(attempts, 2);
                assert_eq!(error.code.as_deref(), Some("PANIC"));
                assert!(error.message.contains("kaboom"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_job_timeout_counts_as_failed_attempt() {
        let mut registry = JobRegistry::new();
        registry
            .register(JobDefinition::new(
                JobIdentifier::<Flaky>::canonical(),
                0,
                |_params: Flaky, _ctx| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
            ))
            .unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let config = WorkerConfig::default().with_job_timeout(Duration::from_millis(20));
        let worker = JobWorker::new(queue.clone(), Arc::new(registry), config);

        let queued = pop(&queue, 0).await;
        match worker.process("test", queued).await {
            JobOutcome::Failed { error, .. } => {
                assert_eq!(error.code.as_deref(), Some("TIMEOUT"))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backoff_delays_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let (queue, worker) = flaky_worker(2, calls.clone());
        let worker = JobWorker {
            config: WorkerConfig::default()
                .with_backoff(BackoffStrategy::fixed(Duration::from_millis(30))),
            ..worker
        };

        let queued = pop(&queue, 2).await;
        let started = std::time::Instant::now();
        let outcome = worker.process("test", queued).await;

        assert_eq!(outcome, JobOutcome::Finished { attempts: 3 });
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_workers() {
        let calls = Arc::new(AtomicU32::new(0));
        let (_queue, worker) = flaky_worker(0, calls);
        let mut handle = worker.start();

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("idle workers did not observe cancellation");
        assert_eq!(handle.running(), 0);
    }

    #[tokio::test]
    async fn test_abort_leaves_job_unacknowledged() {
        let mut registry = JobRegistry::new();
        registry
            .register(JobDefinition::new(
                JobIdentifier::<Flaky>::canonical(),
                0,
                |_params: Flaky, _ctx| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
            ))
            .unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let worker = JobWorker::new(
            queue.clone(),
            Arc::new(registry),
            WorkerConfig::default().with_workers(1),
        );
        let mut handle = worker.start();

        let payload =
            JobEnvelope::encode(&JobIdentifier::<Flaky>::canonical(), &Flaky { fail_times: 0 })
                .unwrap();
        queue.push(payload).await.unwrap();
        while queue.pending_len() == 0 || handle.stats().active() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.stats().active(), 1);

        handle.abort();
        handle.join().await;
        assert_eq!(handle.running(), 0);
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(handle.stats().finished(), 0);
        assert_eq!(handle.stats().active(), 0);
    }

    #[tokio::test]
    async fn test_ack_for_unknown_id_does_not_break_worker() {
        let calls = Arc::new(AtomicU32::new(0));
        let (_queue, worker) = flaky_worker(0, calls.clone());

        // A job the driver never handed out: the acknowledgement fails, the
        // outcome is still reported.
        let payload =
            JobEnvelope::encode(&JobIdentifier::<Flaky>::canonical(), &Flaky { fail_times: 0 })
                .unwrap();
        let outcome = worker
            .process("test", QueuedJob::new(JobId::new(), payload))
            .await;
        assert_eq!(outcome, JobOutcome::Finished { attempts: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
