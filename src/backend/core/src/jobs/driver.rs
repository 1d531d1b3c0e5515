//! Queue driver abstraction.
//!
//! A driver is the storage backend behind a [`JobQueue`](super::JobQueue):
//! it accepts opaque payloads, hands them out to workers, and receives an
//! acknowledgement for every payload it handed out. Drivers never see job
//! types or parameters, only bytes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::job::{JobError, JobId};
use crate::error::Result;

/// A payload held by a driver, from push until acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Driver-assigned identifier
    pub id: JobId,
    /// Encoded job envelope
    pub payload: Vec<u8>,
    /// When the job was pushed
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(id: JobId, payload: Vec<u8>) -> Self {
        Self {
            id,
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// Point-in-time driver statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs pushed but not yet delivered
    pub queued: usize,
    /// Jobs delivered but not yet acknowledged
    pub in_flight: usize,
    /// Jobs acknowledged as finished (total)
    pub finished: u64,
    /// Jobs acknowledged as failed (total)
    pub failed: u64,
    /// Entries currently held in the dead-letter buffer
    pub dead_letter: usize,
    /// Whether the driver stopped yielding jobs
    pub stopped: bool,
}

/// Contract every queue backend implements.
///
/// Every job returned by [`next`](Self::next) must eventually be passed to
/// exactly one of [`finished`](Self::finished) or [`failed`](Self::failed).
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Short backend name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Backend-specific setup. Called once before consumption begins.
    async fn on_init(&self) -> Result<()> {
        Ok(())
    }

    /// Enqueue a payload and return its identifier.
    async fn push(&self, payload: Vec<u8>) -> Result<JobId>;

    /// Wait for the next job. `Ok(None)` ends the sequence: no more work
    /// will be delivered.
    async fn next(&self) -> Result<Option<QueuedJob>>;

    /// Acknowledge successful completion.
    async fn finished(&self, id: JobId) -> Result<()>;

    /// Acknowledge terminal failure.
    async fn failed(&self, id: JobId, error: &JobError) -> Result<()>;

    /// Stop yielding new jobs. Jobs already delivered are unaffected.
    async fn stop(&self);

    /// Release backend resources. Every delivered job must have been
    /// acknowledged first.
    async fn shutdown_gracefully(&self) -> Result<()>;

    /// Current statistics.
    async fn stats(&self) -> Result<QueueStats>;
}

/// Adapt a driver's [`next`](QueueDriver::next) into a stream.
///
/// The stream ends when the driver reports no more work. Driver errors are
/// yielded as items and do not end the stream.
pub fn queued_jobs(driver: Arc<dyn QueueDriver>) -> BoxStream<'static, Result<QueuedJob>> {
    stream::unfold(driver, |driver| async move {
        match driver.next().await {
            Ok(Some(job)) => Some((Ok(job), driver)),
            Ok(None) => None,
            Err(e) => Some((Err(e), driver)),
        }
    })
    .boxed()
}
