//! Worker process: wires configuration, queue, jobs and schedulers together.

pub mod app;
pub mod catalog;
pub mod stats;

pub use app::{QueueBackend, Worker, WorkerError};
pub use catalog::JobCatalog;
