//! Job registry and the single-key envelope codec.
//!
//! Drivers only ever see opaque bytes. A payload is a JSON object with
//! exactly one key, the job-type name, whose value is the encoded
//! parameters:
//!
//! ```text
//! {"send-email": {"to": "a@b.com", "subject": "hi"}}
//! ```
//!
//! The registry maps each job-type name to a builder that turns those
//! parameters back into a runnable [`Job`].

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::identifier::{JobIdentifier, JobParameters};
use super::job::{Job, JobDefinition, TypedJob};
use crate::error::{ErrorCode, QueueError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════════════════════

/// The wire form of a job: a type name plus its encoded parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEnvelope {
    /// Registered job-type name
    pub job_name: String,
    /// Encoded parameters
    pub parameters: Value,
}

impl JobEnvelope {
    /// Wrap parameters under the identifier's name.
    pub fn new<P: Serialize>(id: &JobIdentifier<P>, parameters: &P) -> Result<Self> {
        let parameters = serde_json::to_value(parameters).map_err(|e| {
            QueueError::with_internal(
                ErrorCode::SerializationError,
                format!("Failed to encode parameters for job '{}'", id.name()),
                e.to_string(),
            )
        })?;

        Ok(Self {
            job_name: id.name().to_string(),
            parameters,
        })
    }

    /// Encode `parameters` for `id` straight to payload bytes.
    pub fn encode<P: Serialize>(id: &JobIdentifier<P>, parameters: &P) -> Result<Vec<u8>> {
        Self::new(id, parameters)?.to_bytes()
    }

    /// Serialize as a single-key JSON object.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut object = Map::with_capacity(1);
        object.insert(self.job_name.clone(), self.parameters.clone());
        Ok(serde_json::to_vec(&Value::Object(object))?)
    }

    /// Parse a payload, requiring exactly one top-level key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| {
            QueueError::invalid_envelope(format!("payload is not valid JSON: {}", e))
        })?;

        let Value::Object(object) = value else {
            return Err(QueueError::invalid_envelope(
                "payload is not a JSON object",
            ));
        };

        if object.len() != 1 {
            return Err(QueueError::invalid_envelope(format!(
                "expected exactly one top-level key, found {}",
                object.len()
            )));
        }

        let (job_name, parameters) = object
            .into_iter()
            .next()
            .ok_or_else(|| QueueError::invalid_envelope("payload has no job name"))?;

        Ok(Self {
            job_name,
            parameters,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

type JobBuilder = Box<dyn Fn(Value) -> Result<Box<dyn Job>> + Send + Sync>;

/// Mapping from job-type name to the builder for that type.
///
/// Populated during startup and then shared read-only with every worker.
#[derive(Default)]
pub struct JobRegistry {
    builders: HashMap<String, JobBuilder>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type.
    ///
    /// Registering the same name twice is a configuration defect and
    /// returns [`ErrorCode::DuplicateJobName`].
    pub fn register<P: JobParameters>(&mut self, definition: JobDefinition<P>) -> Result<()> {
        let name = definition.id().name().to_string();
        if self.builders.contains_key(&name) {
            return Err(QueueError::duplicate_job_name(&name));
        }

        let definition = Arc::new(definition);
        let builder: JobBuilder = Box::new(move |parameters| {
            let parameters: P = serde_json::from_value(parameters).map_err(|e| {
                QueueError::with_internal(
                    ErrorCode::DeserializationError,
                    format!(
                        "Parameters do not match job '{}'",
                        definition.id().name()
                    ),
                    e.to_string(),
                )
            })?;
            Ok(Box::new(TypedJob::new(definition.clone(), parameters)) as Box<dyn Job>)
        });

        tracing::debug!(job_name = %name, "Registered job");
        self.builders.insert(name, builder);
        Ok(())
    }

    /// Build a runnable job from an envelope.
    pub fn build(&self, envelope: JobEnvelope) -> Result<Box<dyn Job>> {
        let builder = self
            .builders
            .get(&envelope.job_name)
            .ok_or_else(|| QueueError::unrecognised_job_id(&envelope.job_name))?;
        builder(envelope.parameters)
    }

    /// Decode payload bytes into a runnable job.
    pub fn decode(&self, payload: &[u8]) -> Result<Box<dyn Job>> {
        self.build(JobEnvelope::from_bytes(payload)?)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}
