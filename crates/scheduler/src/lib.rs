//! Periodic enqueue of jobs onto a `QueueClient`.
//!
//! A `PeriodicScheduler` owns one job: it wires the job's handler into the
//! queue at startup, then runs a tick loop that enqueues an empty trigger
//! message every `period` until stopped. The loop only produces messages;
//! execution happens in the queue's own dispatch pool.

pub mod error;
pub mod periodic;

pub use error::SchedulerError;
pub use periodic::{ConfigureHandler, PeriodicScheduler};
