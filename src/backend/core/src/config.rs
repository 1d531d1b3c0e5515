//! Configuration management.
//!
//! Values come from an optional file, then environment variables prefixed
//! `JOBQUEUE__` with `__` between nested keys, e.g.
//! `JOBQUEUE__WORKER__NUM_WORKERS=8` or `JOBQUEUE__QUEUE__POLL_INTERVAL=250ms`.

use serde::Deserialize;

use crate::error::{QueueError, Result};
use crate::jobs::{MemoryQueueConfig, WorkerConfig};
use crate::telemetry::LoggingConfig;

const ENV_PREFIX: &str = "JOBQUEUE";
const ENV_SEPARATOR: &str = "__";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// In-memory driver configuration
    #[serde(default)]
    pub queue: MemoryQueueConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the worker pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker.num_workers == 0 {
            return Err(QueueError::configuration(
                "worker.num_workers must be at least 1",
            ));
        }
        if self.queue.poll_interval.is_zero() {
            return Err(QueueError::configuration(
                "queue.poll_interval must be greater than zero",
            ));
        }
        if self.worker.job_timeout.is_some_and(|t| t.is_zero()) {
            return Err(QueueError::configuration(
                "worker.job_timeout must be greater than zero when set",
            ));
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
