//! Queue client abstraction (register/enqueue contract).
//!
//! The concrete durable queue is an external collaborator; schedulers and the
//! composition root only ever see this trait. A client is an explicit value
//! owned by the composition root, never ambient global state, so several
//! independent queues can coexist (e.g. one per test).

use std::sync::Arc;

use async_trait::async_trait;

use jobforge_core::{MessageId, RetryPolicy, ValidationError};

use crate::error::{EnqueueError, RegisterError};
use crate::handler::JobHandler;

/// Durable, at-least-once queue.
///
/// ## Contract
///
/// - `register` associates a handler with a named queue and a concurrency
///   limit. It is startup wiring: all registrations complete before dispatch
///   starts, and a failed registration must abort startup.
/// - `enqueue` submits a payload for asynchronous delivery to the queue's
///   handler, carrying the retry policy that governs failed deliveries. It
///   never blocks beyond the transport's own timeout.
/// - Handler failures are contained within their own delivery and turned into
///   a retry decision; they never reach the enqueuer.
#[async_trait]
pub trait QueueClient: Send + Sync + 'static {
    fn register(
        &self,
        queue: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegisterError>;

    async fn enqueue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        retry_policy: &RetryPolicy,
    ) -> Result<MessageId, EnqueueError>;
}

#[async_trait]
impl<Q> QueueClient for Arc<Q>
where
    Q: QueueClient + ?Sized,
{
    fn register(
        &self,
        queue: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegisterError> {
        (**self).register(queue, concurrency, handler)
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        retry_policy: &RetryPolicy,
    ) -> Result<MessageId, EnqueueError> {
        (**self).enqueue(queue, payload, retry_policy).await
    }
}

/// Shared argument checks for `register` implementations.
pub(crate) fn validate_registration(queue: &str, concurrency: usize) -> Result<(), RegisterError> {
    if queue.trim().is_empty() {
        return Err(ValidationError::EmptyQueueName.into());
    }
    if concurrency == 0 {
        return Err(ValidationError::ZeroConcurrency {
            queue: queue.to_string(),
        }
        .into());
    }
    Ok(())
}
