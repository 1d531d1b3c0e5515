//! Typed job identifiers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Contract for the parameter type of a job.
///
/// Parameters travel through the driver as JSON, are cloned once per
/// execution attempt, and cross task boundaries.
pub trait JobParameters: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Canonical job-type name for this parameter type.
    const JOB_NAME: &'static str;
}

/// A named handle binding a job-type name to its parameter type `P`.
///
/// Pushing or registering through an identifier is checked against `P` at
/// compile time. Two identifiers are equal iff their names are equal.
pub struct JobIdentifier<P> {
    name: String,
    _parameters: PhantomData<fn() -> P>,
}

impl<P> JobIdentifier<P> {
    /// Create an identifier with an explicit name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _parameters: PhantomData,
        }
    }

    /// The job-type name used as the envelope key.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<P: JobParameters> JobIdentifier<P> {
    /// Identifier named after `P::JOB_NAME`.
    pub fn canonical() -> Self {
        Self::new(P::JOB_NAME)
    }
}

impl<P: JobParameters> Default for JobIdentifier<P> {
    fn default() -> Self {
        Self::canonical()
    }
}

// Manual impls: derives would put bounds on `P`.
impl<P> Clone for JobIdentifier<P> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<P> PartialEq for JobIdentifier<P> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<P> Eq for JobIdentifier<P> {}

impl<P> Hash for JobIdentifier<P> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl<P> fmt::Debug for JobIdentifier<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JobIdentifier").field(&self.name).finish()
    }
}

impl<P> fmt::Display for JobIdentifier<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
