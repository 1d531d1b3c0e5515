//! Error handling for the job queue.
//!
//! This module provides:
//! - A single error type carrying a machine-readable [`ErrorCode`]
//! - Classification of codes into fatal (configuration), per-job terminal,
//!   and driver-level failures
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobqueue_core::error::{QueueError, Result, ErrorContext, ErrorCode};
//!
//! fn load() -> Result<Vec<u8>> {
//!     std::fs::read("payload.json")
//!         .context("Failed to read payload")
//!         .with_error_code(ErrorCode::DriverError)
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::telemetry::metrics as queue_metrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for job queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Registration Errors (1000-1099)
    DuplicateJobName,
    RegistryFrozen,

    // Decode Errors (1100-1199)
    UnrecognisedJobId,
    InvalidEnvelope,

    // Serialization Errors (1200-1299)
    SerializationError,
    DeserializationError,

    // Driver Errors (2000-2099)
    QueueStopped,
    QueueFull,
    JobNotPending,
    PendingJobsOnShutdown,
    DriverError,
    AlreadyRunning,

    // Configuration Errors (5000-5099)
    ConfigurationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::DuplicateJobName => 1000,
            Self::RegistryFrozen => 1001,

            Self::UnrecognisedJobId => 1100,
            Self::InvalidEnvelope => 1101,

            Self::SerializationError => 1200,
            Self::DeserializationError => 1201,

            Self::QueueStopped => 2000,
            Self::QueueFull => 2001,
            Self::JobNotPending => 2002,
            Self::PendingJobsOnShutdown => 2003,
            Self::DriverError => 2004,
            Self::AlreadyRunning => 2005,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Registration and configuration mistakes. These are programming
    /// errors that must abort startup rather than be retried.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateJobName | Self::RegistryFrozen | Self::ConfigurationError
        )
    }

    /// Errors that make a single queued payload unrunnable. The job is
    /// reported once and never retried.
    pub const fn is_job_terminal(&self) -> bool {
        matches!(
            self,
            Self::UnrecognisedJobId | Self::InvalidEnvelope | Self::DeserializationError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "registration",
            1100..=1199 => "decode",
            1200..=1299 => "serialization",
            2000..=2099 => "driver",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// A single job could not be processed
    Low,
    /// Operational issues (stopped queue, unknown acknowledgement)
    Medium,
    /// Backend or serialization failures
    High,
    /// Configuration defects and resource leaks on shutdown
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::UnrecognisedJobId
            | ErrorCode::InvalidEnvelope
            | ErrorCode::DeserializationError => Self::Low,

            ErrorCode::QueueStopped
            | ErrorCode::QueueFull
            | ErrorCode::JobNotPending
            | ErrorCode::AlreadyRunning => Self::Medium,

            ErrorCode::SerializationError | ErrorCode::DriverError => Self::High,

            ErrorCode::DuplicateJobName
            | ErrorCode::RegistryFrozen
            | ErrorCode::PendingJobsOnShutdown
            | ErrorCode::ConfigurationError
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the job queue.
#[derive(Error, Debug)]
pub struct QueueError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human readable message
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl QueueError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both a message and internal detail.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// A job name was registered twice.
    pub fn duplicate_job_name(name: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateJobName,
            format!("A job named '{}' is already registered", name),
        )
    }

    /// Registration was attempted after workers started.
    pub fn registry_frozen(name: &str) -> Self {
        Self::new(
            ErrorCode::RegistryFrozen,
            format!(
                "Cannot register job '{}': the registry is shared with running workers",
                name
            ),
        )
    }

    /// No builder exists for the envelope's job name.
    pub fn unrecognised_job_id(name: &str) -> Self {
        Self::new(
            ErrorCode::UnrecognisedJobId,
            format!("No job registered under '{}'", name),
        )
    }

    /// The envelope did not have the single-key shape.
    pub fn invalid_envelope(reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InvalidEnvelope, "Malformed job envelope", reason)
    }

    /// The driver no longer accepts work.
    pub fn queue_stopped(driver: &str) -> Self {
        Self::new(
            ErrorCode::QueueStopped,
            format!("Queue driver '{}' has been stopped", driver),
        )
    }

    /// The driver is at capacity.
    pub fn queue_full(driver: &str, capacity: usize) -> Self {
        Self::new(
            ErrorCode::QueueFull,
            format!("Queue driver '{}' is full ({} jobs)", driver, capacity),
        )
    }

    /// An acknowledgement referenced an id that is not in flight.
    pub fn job_not_pending(id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::JobNotPending,
            format!("Job {} is not pending acknowledgement", id),
        )
    }

    /// Shutdown was requested while jobs were still in flight.
    pub fn pending_jobs_on_shutdown(count: usize) -> Self {
        Self::new(
            ErrorCode::PendingJobsOnShutdown,
            format!("{} job(s) still in flight at shutdown", count),
        )
    }

    /// A worker pool was already started for this queue.
    pub fn already_running(driver: &str) -> Self {
        Self::new(
            ErrorCode::AlreadyRunning,
            format!("Workers are already running on queue driver '{}'", driver),
        )
    }

    /// Generic backend failure.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::DriverError, "Queue driver failure", message)
    }

    /// Configuration failure.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Invalid configuration",
            message,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builders
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Set the internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }

    pub fn is_job_terminal(&self) -> bool {
        self.code.is_job_terminal()
    }

    /// Log the error at a level matching its severity.
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::Low | ErrorSeverity::Medium => warn!(
                error_code = %self.code,
                category = self.code.category(),
                internal = ?self.internal_message,
                "{}",
                self.message
            ),
            ErrorSeverity::High | ErrorSeverity::Critical => error!(
                error_code = %self.code,
                category = self.code.category(),
                internal = ?self.internal_message,
                source = ?self.source.as_ref().map(|s| s.to_string()),
                "{}",
                self.message
            ),
        }
    }

    fn record_metrics(&self) {
        queue_metrics::record_error(self.code.category(), &self.code.to_string());
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for attaching context to fallible values.
pub trait ErrorContext<T> {
    /// Wrap the error as an internal error with the given message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the error with a specific code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let message = message.into();
            QueueError::internal(format!("{}: {}", message, e)).with_source(e)
        })
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| QueueError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| QueueError::internal(message))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| QueueError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_data() || error.is_syntax() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };
        Self::with_internal(code, "JSON processing failed", error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(error: config::ConfigError) -> Self {
        Self::configuration(error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for QueueError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::DriverError, "I/O failure", error.to_string())
            .with_source(error)
    }
}
