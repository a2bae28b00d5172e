//! Queue error taxonomy.

use thiserror::Error;

use jobforge_core::ValidationError;

/// Registration is startup wiring; every variant is a configuration defect.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegisterError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("queue `{0}` is already registered")]
    Duplicate(String),

    #[error("cannot register queue `{0}` after dispatch has started")]
    DispatchStarted(String),

    #[error("transport error while registering `{queue}`: {reason}")]
    Transport { queue: String, reason: String },
}

/// Enqueue failures are reported to the caller, which decides whether they
/// are fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("queue `{0}` is not registered")]
    UnknownQueue(String),

    #[error("queue `{0}` is closed")]
    Closed(String),

    #[error("queue `{0}` is full")]
    Full(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Failure of a single handler invocation. Feeds the retry decision; never
/// escapes the delivery that produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
