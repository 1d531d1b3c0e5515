//! Job definitions and the type-erased job capability.
//!
//! This module provides the core abstractions for defining background jobs:
//!
//! - **JobDefinition**: identifier + retry budget + typed execute function
//! - **Job trait**: the runnable unit a worker receives after decoding
//! - **JobContext**: per-attempt context passed to the execute function
//! - **JobError**: failure type returned by job bodies
//! - **BackoffStrategy**: optional delay between retry attempts

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::identifier::{JobIdentifier, JobParameters};
use crate::error::QueueError;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Driver-assigned identifier for one queued job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether another attempt may succeed. Fatal errors skip the
    /// remaining retry budget.
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<QueueError> for JobError {
    fn from(error: QueueError) -> Self {
        Self {
            message: error.message().to_string(),
            retryable: !error.is_job_terminal() && !error.is_fatal(),
            code: Some(error.code().to_string()),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::retryable(format!("{:#}", error))
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating the delay before a retry attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Retry immediately
    #[default]
    Immediate,
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// Linear increase in delay (initial + increment * retry)
    Linear {
        initial_delay_ms: u64,
        increment_ms: u64,
    },
    /// Exponential increase in delay (initial * multiplier^retry), capped
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let millis = match self {
            Self::Immediate => 0,
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Linear {
                initial_delay_ms,
                increment_ms,
            } => initial_delay_ms.saturating_add(increment_ms.saturating_mul(retry as u64)),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64) * multiplier.powi(retry as i32);
                delay.min(*max_delay_ms as f64) as u64
            }
        };

        Duration::from_millis(millis)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Exponential backoff doubling from `initial` up to `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            multiplier: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a job for one execution attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    job_name: String,
    attempt: u32,
    max_retry_count: u32,
    worker: String,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(
        job_id: JobId,
        job_name: impl Into<String>,
        attempt: u32,
        max_retry_count: u32,
        worker: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            job_name: job_name.into(),
            attempt,
            max_retry_count,
            worker: worker.into(),
        }
    }

    /// Get the job ID.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Get the job type name.
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Current attempt number (0 for the first execution).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Executions made so far, counting this one.
    pub fn attempts_made(&self) -> u32 {
        self.attempt.saturating_add(1)
    }

    /// Retries allowed after the first attempt.
    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    /// Whether this attempt is the last one the retry budget allows.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_retry_count
    }

    /// Name of the worker running this attempt.
    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub(crate) fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job_id,
            job_name = %self.job_name,
            attempt = self.attempt,
            message
        );
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job_id,
            job_name = %self.job_name,
            attempt = self.attempt,
            message
        );
    }

    /// Log an error associated with this job.
    pub fn log_error(&self, message: &str) {
        tracing::error!(
            job_id = %self.job_id,
            job_name = %self.job_name,
            attempt = self.attempt,
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A decoded, directly runnable job.
///
/// Instances are built by the registry for each dequeued payload and dropped
/// once the job reaches a terminal state.
#[async_trait]
pub trait Job: Send + Sync {
    /// The registered job-type name.
    fn name(&self) -> &str;

    /// Retries allowed after the first attempt.
    fn max_retry_count(&self) -> u32;

    /// Run one attempt.
    async fn execute(&self, ctx: &JobContext) -> JobResult;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Definition
// ═══════════════════════════════════════════════════════════════════════════════

type ExecuteFn<P> = dyn Fn(P, JobContext) -> BoxFuture<'static, JobResult> + Send + Sync;

/// Identifier, retry budget and execute function for one job type.
pub struct JobDefinition<P> {
    id: JobIdentifier<P>,
    max_retry_count: u32,
    execute: Arc<ExecuteFn<P>>,
}

impl<P: JobParameters> JobDefinition<P> {
    /// Define a job type.
    pub fn new<F, Fut>(id: JobIdentifier<P>, max_retry_count: u32, execute: F) -> Self
    where
        F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        Self {
            id,
            max_retry_count,
            execute: Arc::new(move |parameters: P, ctx: JobContext| {
                execute(parameters, ctx).boxed()
            }),
        }
    }

    pub fn id(&self) -> &JobIdentifier<P> {
        &self.id
    }

    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    /// Run the execute function once.
    pub async fn execute(&self, parameters: P, ctx: JobContext) -> JobResult {
        (self.execute)(parameters, ctx).await
    }
}

impl<P> fmt::Debug for JobDefinition<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("id", &self.id)
            .field("max_retry_count", &self.max_retry_count)
            .finish_non_exhaustive()
    }
}

/// A definition paired with decoded parameters.
pub struct TypedJob<P> {
    definition: Arc<JobDefinition<P>>,
    parameters: P,
}

impl<P: JobParameters> TypedJob<P> {
    pub fn new(definition: Arc<JobDefinition<P>>, parameters: P) -> Self {
        Self {
            definition,
            parameters,
        }
    }

    pub fn parameters(&self) -> &P {
        &self.parameters
    }
}

#[async_trait]
impl<P: JobParameters> Job for TypedJob<P> {
    fn name(&self) -> &str {
        self.definition.id().name()
    }

    fn max_retry_count(&self) -> u32 {
        self.definition.max_retry_count()
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult {
        self.definition
            .execute(self.parameters.clone(), ctx.clone())
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
