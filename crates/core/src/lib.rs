//! `jobforge-core`: scheduling and retry building blocks.
//!
//! This crate contains **pure** primitives (no IO, no async): retry arithmetic,
//! the message envelope handed to queues, and the static description of a job.

pub mod error;
pub mod id;
pub mod job;
pub mod message;
pub mod retry;

pub use error::{ValidationError, ValidationResult};
pub use id::MessageId;
pub use job::JobSpec;
pub use message::Message;
pub use retry::{RetryDecision, RetryPolicy};
