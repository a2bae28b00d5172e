//! Configuration/validation error model.

use std::time::Duration;

use thiserror::Error;

/// Result type used by constructors that validate their input.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// A startup wiring or configuration defect.
///
/// These are never produced while jobs are running: every value that can fail
/// validation is built once, before any tick loop starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// Queue names identify registrations and must not be blank.
    #[error("queue name must not be empty")]
    EmptyQueueName,

    #[error("concurrency for queue `{queue}` must be greater than zero")]
    ZeroConcurrency { queue: String },

    #[error("retry min delay {min:?} exceeds max delay {max:?}")]
    InvertedDelayBounds { min: Duration, max: Duration },

    #[error("retry exponent must be a finite, non-negative number (got {0})")]
    InvalidExponent(f64),

    /// A job needs a metadata key that the configuration did not provide.
    #[error("job `{queue}` is missing required metadata key `{key}`")]
    MissingMetadata { queue: String, key: String },

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl ValidationError {
    pub fn missing_metadata(queue: impl Into<String>, key: impl Into<String>) -> Self {
        Self::MissingMetadata {
            queue: queue.into(),
            key: key.into(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
