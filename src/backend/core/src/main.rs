//! Jobqueue Worker - Main entry point
//!
//! Runs an in-memory job queue with a demo `send-email` job until Ctrl+C or
//! SIGTERM, then shuts down in two phases: stop intake, drain in-flight jobs.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use jobqueue_core::{
    config::Config,
    jobs::{
        JobContext, JobError, JobIdentifier, JobParameters, JobQueue, JobResult, MemoryQueue,
        QueueDriver,
    },
    telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "jobqueue-worker", version, about = "Background job queue worker")]
struct Args {
    /// Path to a configuration file
    #[arg(short, long, env = "JOBQUEUE_CONFIG")]
    config: Option<String>,

    /// Number of concurrent workers (overrides configuration)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Number of demo jobs to enqueue at startup
    #[arg(long, default_value_t = 10)]
    demo_jobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SendEmail {
    to: String,
    subject: String,
}

impl JobParameters for SendEmail {
    const JOB_NAME: &'static str = "send-email";
}

async fn send_email(email: SendEmail, ctx: JobContext) -> JobResult {
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Simulated transient outage for the first attempt at flaky addresses.
    if email.to.ends_with("@flaky.test") && ctx.attempt() == 0 {
        return Err(JobError::retryable("SMTP connection reset").with_code("SMTP_RESET"));
    }
    if !email.to.contains('@') {
        return Err(JobError::fatal(format!("invalid recipient '{}'", email.to)));
    }

    ctx.log_info(&format!("Sent '{}' to {}", email.subject, email.to));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };
    if let Some(workers) = args.workers {
        config.worker.num_workers = workers;
        config.validate()?;
    }

    telemetry::init_telemetry(&config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = config.worker.num_workers,
        "Starting jobqueue worker"
    );

    let driver = Arc::new(MemoryQueue::with_config(config.queue.clone()).on_failed(
        |id, payload, error| {
            tracing::error!(
                job_id = %id,
                payload = %String::from_utf8_lossy(payload),
                error = %error,
                "Job dead-lettered"
            );
        },
    ));

    let mut queue = JobQueue::new(driver.clone(), config.worker.clone());
    queue.register_job(JobIdentifier::<SendEmail>::canonical(), 2, send_email)?;

    let handle = queue.run().await?;

    let id = JobIdentifier::<SendEmail>::canonical();
    for i in 0..args.demo_jobs {
        let to = match i % 5 {
            3 => format!("user{}@flaky.test", i),
            4 => format!("user{}", i),
            _ => format!("user{}@example.com", i),
        };
        let email = SendEmail {
            to,
            subject: format!("Welcome #{}", i),
        };
        queue.push(&id, &email).await?;
    }
    tracing::info!(count = args.demo_jobs, "Demo jobs enqueued");

    shutdown_signal().await;

    let stats = handle.stats().clone();
    handle.shutdown().await?;

    let leftover = driver.take_undelivered();
    if !leftover.is_empty() {
        tracing::warn!(count = leftover.len(), "Jobs left undelivered at shutdown");
    }
    let queue_stats = driver.stats().await?;
    tracing::info!(
        finished = stats.finished(),
        failed = stats.failed(),
        retried = stats.retried(),
        dead_letter = queue_stats.dead_letter,
        "Worker shutdown complete"
    );

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
