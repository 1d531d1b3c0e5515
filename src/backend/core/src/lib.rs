#![allow(clippy::result_large_err)]
//! # Jobqueue Core
//!
//! Asynchronous background job queue.
//!
//! ## Architecture
//!
//! - **Jobs**: typed identifiers, definitions with a retry budget, and a
//!   registry that decodes single-key JSON envelopes into runnable jobs
//! - **Drivers**: pluggable queue backends; an in-memory driver ships here
//! - **Workers**: a pool of consumers with bounded retry and two-phase
//!   shutdown
//! - **Telemetry**: structured logging and job lifecycle metrics
//! - **Config**: layered file + environment configuration

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, QueueError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, QueueError, Result};
    pub use crate::jobs::{
        BackoffStrategy, JobContext, JobDefinition, JobError, JobId, JobIdentifier,
        JobParameters, JobQueue, JobResult, MemoryQueue, MemoryQueueConfig, QueueDriver,
        WorkerConfig, WorkerHandle,
    };
}
