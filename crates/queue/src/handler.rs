//! Handler abstraction.

use std::future::Future;

use async_trait::async_trait;

use jobforge_core::Message;

use crate::error::HandlerError;

/// Acknowledgment of one delivery: `Ok` acks, `Err` nacks with the reason.
pub type HandlerResult = Result<(), HandlerError>;

/// The unit of work executed for each delivered message.
///
/// Handlers must be idempotent: delivery is at-least-once, and a failed
/// delivery is retried according to the message's retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> HandlerResult;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F> core::fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> HandlerResult {
        (self.f)(message.clone()).await
    }
}
