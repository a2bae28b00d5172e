use thiserror::Error;

use jobforge_core::ValidationError;
use jobforge_queue::RegisterError;

/// A `PeriodicScheduler` is single-use: once stopped it cannot be restarted,
/// because its handler registration is write-once on the queue.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("scheduler for queue `{0}` is already started")]
    AlreadyStarted(String),

    #[error("scheduler for queue `{0}` was stopped and cannot be restarted")]
    Finished(String),

    #[error("invalid job configuration: {0}")]
    Configuration(#[from] ValidationError),

    #[error("handler registration failed: {0}")]
    Registration(#[from] RegisterError),
}
