//! Queue abstraction with at-least-once delivery and policy-driven retries.
//!
//! ## Components
//!
//! - `QueueClient`: register a handler per named queue, enqueue payloads
//! - `JobHandler`: the unit of work invoked per delivered message
//! - `Middleware`: cross-cutting wrappers around every delivery
//! - `Dispatcher`: runs one delivery and applies the message's `RetryPolicy`
//! - `InMemoryQueue`: in-process backend (tests, single-node deployments)
//! - `RedisQueue`: Redis-backed backend (feature `redis`)

pub mod client;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod in_memory;
pub mod middleware;
#[cfg(feature = "redis")]
pub mod redis;
pub mod stats;

pub use client::QueueClient;
pub use dispatch::{DeadLetterEntry, Delivery, Dispatcher, Registration};
pub use error::{EnqueueError, HandlerError, RegisterError};
pub use handler::{HandlerFn, HandlerResult, JobHandler, handler_fn};
pub use in_memory::{InMemoryQueue, QueueLimits};
pub use middleware::{LoggingMiddleware, Middleware, MiddlewareChain, Next};
#[cfg(feature = "redis")]
pub use redis::{DeadLetters, RedisQueue, RedisQueueConfig, RedisQueueError};
pub use stats::{QueueStats, QueueStatsSnapshot, StatsSource};
