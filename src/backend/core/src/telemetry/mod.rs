//! Telemetry: structured logging and metrics.
//!
//! - **Logging**: `tracing-subscriber` with JSON/pretty/compact output
//! - **Metrics**: job lifecycle counters through the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use jobqueue_core::telemetry::{init_telemetry, LoggingConfig};
//!
//! init_telemetry(&LoggingConfig::default()).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use metrics::{describe_metrics, JobMetrics, JobTimer};

/// Initialize logging and register metric descriptions.
///
/// Call once at process startup.
pub fn init_telemetry(config: &LoggingConfig) -> anyhow::Result<()> {
    init_logging(config)?;
    describe_metrics();
    ::tracing::debug!(format = ?config.format, level = %config.level, "Telemetry initialized");
    Ok(())
}
