//! Application-facing job queue.
//!
//! [`JobQueue`] ties a driver and a registry together: jobs are registered
//! at startup, pushed from anywhere in the application, and consumed by the
//! worker pool started with [`JobQueue::run`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::driver::{QueueDriver, QueueStats};
use super::identifier::{JobIdentifier, JobParameters};
use super::job::{JobContext, JobDefinition, JobId, JobResult};
use super::memory::MemoryQueue;
use super::registry::{JobEnvelope, JobRegistry};
use super::worker::{JobWorker, WorkerConfig, WorkerHandle};
use crate::error::{QueueError, Result};
use crate::telemetry::metrics::JobMetrics;

/// Job queue facade over a driver, a registry and a worker pool.
pub struct JobQueue {
    driver: Arc<dyn QueueDriver>,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
    running: AtomicBool,
}

impl JobQueue {
    /// Create a queue over `driver`.
    pub fn new(driver: Arc<dyn QueueDriver>, config: WorkerConfig) -> Self {
        Self {
            driver,
            registry: Arc::new(JobRegistry::new()),
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Create a queue backed by a default [`MemoryQueue`].
    pub fn in_memory(config: WorkerConfig) -> Self {
        Self::new(Arc::new(MemoryQueue::new()), config)
    }

    pub fn driver(&self) -> &Arc<dyn QueueDriver> {
        &self.driver
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Register a job definition.
    ///
    /// Fails with `RegistryFrozen` while a worker pool started by
    /// [`run`](Self::run) still shares the registry.
    pub fn register<P: JobParameters>(&mut self, definition: JobDefinition<P>) -> Result<()> {
        let name = definition.id().name().to_string();
        Arc::get_mut(&mut self.registry)
            .ok_or_else(|| QueueError::registry_frozen(&name))?
            .register(definition)
    }

    /// Register a job type from its identifier, retry budget and body.
    pub fn register_job<P, F, Fut>(
        &mut self,
        id: JobIdentifier<P>,
        max_retry_count: u32,
        execute: F,
    ) -> Result<()>
    where
        P: JobParameters,
        F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.register(JobDefinition::new(id, max_retry_count, execute))
    }

    /// Encode `parameters` under `id` and hand them to the driver.
    ///
    /// The job type does not have to be registered in this process; a
    /// consumer elsewhere may own it.
    pub async fn push<P: JobParameters>(
        &self,
        id: &JobIdentifier<P>,
        parameters: &P,
    ) -> Result<JobId> {
        let payload = JobEnvelope::encode(id, parameters)?;
        let job_id = self.driver.push(payload).await?;

        JobMetrics::pushed(id.name());
        debug!(
            job_id = %job_id,
            job_name = %id.name(),
            driver = self.driver.name(),
            registered = self.registry.contains(id.name()),
            "Job pushed"
        );
        Ok(job_id)
    }

    /// Initialise the driver and start consuming.
    ///
    /// A queue runs one worker pool. Calling this again fails with
    /// `AlreadyRunning`.
    pub async fn run(&self) -> Result<WorkerHandle> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(QueueError::already_running(self.driver.name()));
        }

        if let Err(e) = self.driver.on_init().await {
            self.running.store(false, Ordering::Release);
            return Err(e);
        }

        if self.registry.is_empty() {
            warn!(
                driver = self.driver.name(),
                "Starting workers with no registered jobs; every job will be rejected"
            );
        }
        info!(
            driver = self.driver.name(),
            jobs = self.registry.len(),
            "Job queue running"
        );

        let worker = JobWorker::new(
            self.driver.clone(),
            self.registry.clone(),
            self.config.clone(),
        );
        Ok(worker.start())
    }

    /// Driver statistics.
    pub async fn stats(&self) -> Result<QueueStats> {
        self.driver.stats().await
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("driver", &self.driver.name())
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl JobParameters for Ping {
        const JOB_NAME: &'static str = "ping";
    }

    #[tokio::test]
    async fn test_push_encodes_single_key_envelope() {
        let memory = Arc::new(MemoryQueue::new());
        let queue = JobQueue::new(memory.clone(), WorkerConfig::default());

        let id = queue
            .push(&JobIdentifier::<Ping>::canonical(), &Ping { seq: 7 })
            .await
            .unwrap();

        let job = memory.next().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        let value: serde_json::Value = serde_json::from_slice(&job.payload).unwrap();
        assert_eq!(value, serde_json::json!({"ping": {"seq": 7}}));
    }

    #[tokio::test]
    async fn test_push_under_custom_name() {
        let memory = Arc::new(MemoryQueue::new());
        let queue = JobQueue::new(memory.clone(), WorkerConfig::default());

        queue
            .push(&JobIdentifier::<Ping>::new("ping-v2"), &Ping { seq: 1 })
            .await
            .unwrap();

        let job = memory.next().await.unwrap().unwrap();
        let envelope = JobEnvelope::from_bytes(&job.payload).unwrap();
        assert_eq!(envelope.job_name, "ping-v2");
    }

    #[test]
    fn test_register_duplicate() {
        let mut queue = JobQueue::in_memory(WorkerConfig::default());
        queue
            .register_job(JobIdentifier::<Ping>::canonical(), 0, |_p, _ctx| async { Ok(()) })
            .unwrap();
        let err = queue
            .register_job(JobIdentifier::<Ping>::canonical(), 3, |_p, _ctx| async { Ok(()) })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateJobName);
        assert_eq!(queue.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_register_while_running_is_rejected() {
        let mut queue = JobQueue::in_memory(WorkerConfig::default().with_workers(1));
        queue
            .register_job(JobIdentifier::<Ping>::canonical(), 0, |_p, _ctx| async { Ok(()) })
            .unwrap();

        let handle = queue.run().await.unwrap();
        let err = queue
            .register_job(JobIdentifier::<Ping>::new("pong"), 0, |_p, _ctx| async { Ok(()) })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RegistryFrozen);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let memory = Arc::new(MemoryQueue::new());
        let mut queue = JobQueue::new(memory.clone(), WorkerConfig::default().with_workers(2));
        queue
            .register_job(JobIdentifier::<Ping>::canonical(), 0, |_p, _ctx| async { Ok(()) })
            .unwrap();

        let handle = queue.run().await.unwrap();
        let err = queue.run().await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::AlreadyRunning);
        assert_eq!(handle.running(), 2);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_push_after_stop_fails() {
        let queue = JobQueue::in_memory(WorkerConfig::default());
        queue.driver().stop().await;

        let err = queue
            .push(&JobIdentifier::<Ping>::canonical(), &Ping { seq: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueueStopped);
    }
}
