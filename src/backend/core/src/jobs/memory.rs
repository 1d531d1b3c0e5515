//! In-memory queue driver.
//!
//! All queue state lives in one mutex-guarded struct. The lock is never held
//! across an `.await`, so a worker waiting in [`QueueDriver::next`] does not
//! block pushes or acknowledgements from other tasks. Waiting workers are
//! woken on push and on stop; `poll_interval` bounds the wait in case a
//! wake-up is missed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

use super::driver::{QueueDriver, QueueStats, QueuedJob};
use super::job::{JobError, JobId};
use crate::error::{QueueError, Result};
use crate::telemetry::metrics::set_queue_depth;

const DRIVER_NAME: &str = "memory";

/// Floor applied to `poll_interval`; a zero wait would spin in `next()`.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for the in-memory driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryQueueConfig {
    /// Upper bound on a single wait inside `next()`
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Maximum queued (undelivered) jobs, 0 = unlimited
    #[serde(default)]
    pub max_size: usize,
    /// Maximum entries kept in the dead-letter buffer
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_size: 0,
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_dead_letter_capacity() -> usize {
    1000
}

/// A job whose retry budget ran out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: JobId,
    pub payload: Vec<u8>,
    pub error: JobError,
    pub failed_at: DateTime<Utc>,
}

/// Bounded buffer of failed jobs. The oldest entry is evicted when full.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: VecDeque<DeadLetterEntry>,
    max_size: usize,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size,
        }
    }

    pub fn push(&mut self, entry: DeadLetterEntry) {
        if self.max_size == 0 {
            return;
        }
        if self.entries.len() >= self.max_size {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<DeadLetterEntry> {
        self.entries.drain(..).collect()
    }
}

/// Callback invoked for every job acknowledged as failed.
pub type FailedJobCallback = Arc<dyn Fn(JobId, &[u8], &JobError) + Send + Sync>;

struct MemoryState {
    queue: VecDeque<QueuedJob>,
    pending: HashMap<JobId, Vec<u8>>,
    stopped: bool,
    finished: u64,
    failed: u64,
    dead_letter: DeadLetterQueue,
}

/// Deque-backed reference driver.
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
    wakeup: Notify,
    config: MemoryQueueConfig,
    on_failed: Option<FailedJobCallback>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_config(MemoryQueueConfig::default())
    }

    pub fn with_config(mut config: MemoryQueueConfig) -> Self {
        if config.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                requested = ?config.poll_interval,
                applied = ?MIN_POLL_INTERVAL,
                "Memory queue poll interval too small, clamping"
            );
            config.poll_interval = MIN_POLL_INTERVAL;
        }

        Self {
            state: Mutex::new(MemoryState {
                queue: VecDeque::new(),
                pending: HashMap::new(),
                stopped: false,
                finished: 0,
                failed: 0,
                dead_letter: DeadLetterQueue::new(config.dead_letter_capacity),
            }),
            wakeup: Notify::new(),
            config,
            on_failed: None,
        }
    }

    /// Set the dead-letter hook, called with the original payload.
    pub fn on_failed<F>(mut self, callback: F) -> Self
    where
        F: Fn(JobId, &[u8], &JobError) + Send + Sync + 'static,
    {
        self.on_failed = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &MemoryQueueConfig {
        &self.config
    }

    /// Jobs pushed but not yet delivered.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Jobs delivered but not yet acknowledged.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Snapshot of the dead-letter buffer, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.state.lock().dead_letter.entries.iter().cloned().collect()
    }

    /// Remove and return every dead-letter entry.
    pub fn drain_dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.state.lock().dead_letter.drain()
    }

    /// Remove and return jobs that were pushed but never delivered.
    ///
    /// After [`stop`](QueueDriver::stop) these jobs stay buffered; this is
    /// how a caller recovers them.
    pub fn take_undelivered(&self) -> Vec<QueuedJob> {
        let mut state = self.state.lock();
        let jobs: Vec<QueuedJob> = state.queue.drain(..).collect();
        set_queue_depth(DRIVER_NAME, 0);
        jobs
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryQueue")
            .field("queued", &state.queue.len())
            .field("pending", &state.pending.len())
            .field("stopped", &state.stopped)
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl QueueDriver for MemoryQueue {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn push(&self, payload: Vec<u8>) -> Result<JobId> {
        let id = JobId::new();
        {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(QueueError::queue_stopped(DRIVER_NAME));
            }
            if self.config.max_size > 0 && state.queue.len() >= self.config.max_size {
                return Err(QueueError::queue_full(DRIVER_NAME, self.config.max_size));
            }
            state.queue.push_back(QueuedJob::new(id, payload));
            set_queue_depth(DRIVER_NAME, state.queue.len());
        }
        self.wakeup.notify_one();
        Ok(id)
    }

    async fn next(&self) -> Result<Option<QueuedJob>> {
        loop {
            // Register interest before checking state so a push between the
            // check and the wait is not missed.
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.stopped {
                    return Ok(None);
                }
                if let Some(job) = state.queue.pop_front() {
                    state.pending.insert(job.id, job.payload.clone());
                    set_queue_depth(DRIVER_NAME, state.queue.len());
                    return Ok(Some(job));
                }
            }

            let _ = tokio::time::timeout(self.config.poll_interval, notified).await;
        }
    }

    async fn finished(&self, id: JobId) -> Result<()> {
        let mut state = self.state.lock();
        state
            .pending
            .remove(&id)
            .ok_or_else(|| QueueError::job_not_pending(id))?;
        state.finished += 1;
        Ok(())
    }

    async fn failed(&self, id: JobId, error: &JobError) -> Result<()> {
        let payload = {
            let mut state = self.state.lock();
            let payload = state
                .pending
                .remove(&id)
                .ok_or_else(|| QueueError::job_not_pending(id))?;
            state.failed += 1;
            state.dead_letter.push(DeadLetterEntry {
                id,
                payload: payload.clone(),
                error: error.clone(),
                failed_at: Utc::now(),
            });
            payload
        };

        tracing::warn!(job_id = %id, error = %error, "Job moved to dead letter");

        if let Some(callback) = &self.on_failed {
            callback(id, &payload, error);
        }
        Ok(())
    }

    async fn stop(&self) {
        let undelivered = {
            let mut state = self.state.lock();
            state.stopped = true;
            state.queue.len()
        };
        self.wakeup.notify_waiters();
        tracing::info!(driver = DRIVER_NAME, undelivered, "Queue driver stopped");
    }

    async fn shutdown_gracefully(&self) -> Result<()> {
        let (pending, undelivered) = {
            let mut state = self.state.lock();
            state.stopped = true;
            (state.pending.len(), state.queue.len())
        };
        self.wakeup.notify_waiters();

        if pending > 0 {
            return Err(QueueError::pending_jobs_on_shutdown(pending));
        }
        if undelivered > 0 {
            tracing::warn!(
                driver = DRIVER_NAME,
                undelivered,
                "Shutting down with undelivered jobs still buffered"
            );
        }
        tracing::info!(driver = DRIVER_NAME, "Queue driver shut down");
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock();
        Ok(QueueStats {
            queued: state.queue.len(),
            in_flight: state.pending.len(),
            finished: state.finished,
            failed: state.failed,
            dead_letter: state.dead_letter.len(),
            stopped: state.stopped,
        })
    }
}
