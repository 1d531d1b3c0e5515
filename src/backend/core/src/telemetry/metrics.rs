//! Job queue metrics.
//!
//! Counters and histograms are emitted through the `metrics` facade. No
//! exporter is installed here; whatever recorder the host process registers
//! receives them, and without one every call is a no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use jobqueue_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::pushed("send-email");
//! let timer = JobMetrics::start("send-email");
//! // ... run the job ...
//! timer.finish(true);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

pub const JOBS_PUSHED_TOTAL: &str = "jobqueue_jobs_pushed_total";
pub const JOBS_FINISHED_TOTAL: &str = "jobqueue_jobs_finished_total";
pub const JOBS_FAILED_TOTAL: &str = "jobqueue_jobs_failed_total";
pub const JOBS_REJECTED_TOTAL: &str = "jobqueue_jobs_rejected_total";
pub const JOB_RETRIES_TOTAL: &str = "jobqueue_job_retries_total";
pub const JOB_DURATION_SECONDS: &str = "jobqueue_job_duration_seconds";
pub const QUEUE_DEPTH: &str = "jobqueue_queue_depth";
pub const ERRORS_TOTAL: &str = "jobqueue_errors_total";

/// Register descriptions for every metric emitted by the crate.
///
/// Call once after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(JOBS_PUSHED_TOTAL, "Total number of jobs pushed to a driver");
    describe_counter!(
        JOBS_FINISHED_TOTAL,
        "Total number of jobs acknowledged as finished"
    );
    describe_counter!(
        JOBS_FAILED_TOTAL,
        "Total number of jobs acknowledged as failed after exhausting retries"
    );
    describe_counter!(
        JOBS_REJECTED_TOTAL,
        "Total number of payloads that could not be decoded into a job"
    );
    describe_counter!(JOB_RETRIES_TOTAL, "Total number of job re-executions");
    describe_histogram!(
        JOB_DURATION_SECONDS,
        "Job execution duration in seconds, across all attempts"
    );
    describe_gauge!(QUEUE_DEPTH, "Number of queued jobs not yet delivered");
    describe_counter!(ERRORS_TOTAL, "Total number of queue errors by category");
}

/// Job lifecycle counters.
pub struct JobMetrics;

impl JobMetrics {
    /// A job was accepted by the driver.
    pub fn pushed(job_name: &str) {
        counter!(JOBS_PUSHED_TOTAL, "job_name" => job_name.to_string()).increment(1);
    }

    /// A job is about to be executed again.
    pub fn retried(job_name: &str) {
        counter!(JOB_RETRIES_TOTAL, "job_name" => job_name.to_string()).increment(1);
    }

    /// A payload could not be turned into a runnable job.
    pub fn rejected(error_code: &str) {
        counter!(JOBS_REJECTED_TOTAL, "code" => error_code.to_string()).increment(1);
    }

    /// Start timing the execution of a job.
    pub fn start(job_name: &str) -> JobTimer {
        JobTimer {
            start: Instant::now(),
            job_name: job_name.to_string(),
        }
    }
}

/// Measures a job from its first attempt to its terminal acknowledgement.
pub struct JobTimer {
    start: Instant,
    job_name: String,
}

impl JobTimer {
    /// Record the duration and the terminal outcome.
    pub fn finish(self, succeeded: bool) {
        let outcome = if succeeded { "finished" } else { "failed" };
        histogram!(
            JOB_DURATION_SECONDS,
            "job_name" => self.job_name.clone(),
            "outcome" => outcome,
        )
        .record(self.start.elapsed().as_secs_f64());

        let name = if succeeded {
            JOBS_FINISHED_TOTAL
        } else {
            JOBS_FAILED_TOTAL
        };
        counter!(name, "job_name" => self.job_name).increment(1);
    }
}

/// Report the number of undelivered jobs held by a driver.
pub fn set_queue_depth(driver: &'static str, depth: usize) {
    gauge!(QUEUE_DEPTH, "driver" => driver).set(depth as f64);
}

/// Count an error by category and code.
pub fn record_error(category: &'static str, code: &str) {
    counter!(
        ERRORS_TOTAL,
        "category" => category,
        "code" => code.to_string(),
    )
    .increment(1);
}
