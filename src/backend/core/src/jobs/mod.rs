//! Asynchronous job queue.
//!
//! - **Identifiers & definitions**: typed job names bound to parameter types,
//!   with a retry budget and an async body
//! - **Registry**: name → builder map that decodes payloads into runnable jobs
//! - **Driver**: pluggable storage backend that only ever sees bytes
//! - **Worker pool**: concurrent consumers with bounded retry and
//!   two-phase shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               JobQueue                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  push(id, params)                                                       │
//! │        │  JobEnvelope::encode → {"job-name": {...params}}               │
//! │        ▼                                                                │
//! │  ┌─────────────┐   next()    ┌─────────────┐  decode   ┌─────────────┐  │
//! │  │ QueueDriver │────────────▶│  JobWorker  │──────────▶│ JobRegistry │  │
//! │  │  (memory)   │◀────────────│  × N tasks  │◀──────────│  (builders) │  │
//! │  └─────────────┘ finished()  └─────────────┘  Box<Job> └─────────────┘  │
//! │                  failed()          │                                    │
//! │                                    ▼                                    │
//! │                       execute, retry up to max_retry_count              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobqueue_core::jobs::{JobIdentifier, JobParameters, JobQueue, WorkerConfig};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct SendEmail { to: String }
//!
//! impl JobParameters for SendEmail {
//!     const JOB_NAME: &'static str = "send-email";
//! }
//!
//! let mut queue = JobQueue::in_memory(WorkerConfig::default());
//! queue.register_job(JobIdentifier::<SendEmail>::canonical(), 3, |email, ctx| async move {
//!     ctx.log_info(&format!("sending to {}", email.to));
//!     Ok(())
//! })?;
//!
//! let handle = queue.run().await?;
//! queue.push(&JobIdentifier::canonical(), &SendEmail { to: "a@b.com".into() }).await?;
//! handle.shutdown().await?;
//! ```

pub mod driver;
pub mod identifier;
pub mod job;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod worker;

pub use driver::{queued_jobs, QueueDriver, QueueStats, QueuedJob};
pub use identifier::{JobIdentifier, JobParameters};
pub use job::{
    BackoffStrategy, Job, JobContext, JobDefinition, JobError, JobId, JobResult, TypedJob,
};
pub use memory::{
    DeadLetterEntry, DeadLetterQueue, FailedJobCallback, MemoryQueue, MemoryQueueConfig,
    MIN_POLL_INTERVAL,
};
pub use queue::JobQueue;
pub use registry::{JobEnvelope, JobRegistry};
pub use worker::{JobOutcome, JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
