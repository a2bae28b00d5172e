//! Delivery engine shared by the queue backends.
//!
//! A backend pulls a message off its transport, acquires a concurrency permit
//! and hands the message to [`Dispatcher::deliver`]. The dispatcher runs the
//! middleware chain and handler in an isolated task, then consults the
//! message's retry policy and tells the backend what to do next.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use jobforge_core::{Message, RetryDecision};

use crate::error::HandlerError;
use crate::handler::{HandlerResult, JobHandler};
use crate::middleware::MiddlewareChain;
use crate::stats::QueueStats;

/// A handler bound to a queue.
pub struct Registration {
    pub queue: String,
    pub concurrency: usize,
    pub handler: Arc<dyn JobHandler>,
    pub stats: Arc<QueueStats>,
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("queue", &self.queue)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Registration {
    pub fn new(queue: impl Into<String>, concurrency: usize, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            queue: queue.into(),
            concurrency,
            handler,
            stats: Arc::new(QueueStats::default()),
        }
    }
}

/// A message that permanently failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: Message,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(message: Message, reason: String) -> Self {
        Self {
            message,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

/// What the backend must do once a delivery has finished.
#[derive(Debug)]
pub enum Delivery {
    /// Acknowledged; drop the message.
    Completed,
    /// Redeliver `message` (attempt already bumped) after `delay`.
    Retry { message: Message, delay: Duration },
    /// Permanently failed; park it in the dead-letter store.
    Dead(DeadLetterEntry),
}

/// Runs deliveries through the middleware chain and applies retry policy.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    middleware: Arc<MiddlewareChain>,
}

impl Dispatcher {
    pub fn new(middleware: MiddlewareChain) -> Self {
        Self {
            middleware: Arc::new(middleware),
        }
    }

    /// Deliver one message to the registration's handler.
    ///
    /// The chain runs in its own task so a panicking handler (or middleware)
    /// cannot take down the caller's dispatch loop or sibling deliveries.
    pub async fn deliver(&self, registration: &Registration, message: Message) -> Delivery {
        let stats = registration.stats.clone();
        stats.delivery_started();

        let chain = self.middleware.clone();
        let handler = registration.handler.clone();
        let queue = registration.queue.clone();
        let in_task = message.clone();

        let joined = tokio::spawn(async move {
            chain.run(&queue, &in_task, handler.as_ref()).await
        })
        .await;

        let result: HandlerResult = match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let reason = panic_reason(e.into_panic());
                error!(
                    queue = %registration.queue,
                    message_id = %message.id,
                    panic = %reason,
                    "handler panicked"
                );
                Err(HandlerError::Panicked(reason))
            }
            Err(e) => Err(HandlerError::failed(format!("delivery aborted: {}", e))),
        };

        stats.delivery_finished(result.is_ok());

        match result {
            Ok(()) => Delivery::Completed,
            Err(e) => self.after_failure(registration, message, e),
        }
    }

    fn after_failure(
        &self,
        registration: &Registration,
        mut message: Message,
        err: HandlerError,
    ) -> Delivery {
        message.record_failure(err.to_string());
        let decision = message
            .retry_policy
            .decide(message.attempt, &mut rand::thread_rng());

        match decision {
            RetryDecision::Retry { attempt, delay } => {
                registration.stats.record_retry();
                warn!(
                    queue = %registration.queue,
                    message_id = %message.id,
                    attempt,
                    max_retries = message.retry_policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "job failed, scheduling retry"
                );
                Delivery::Retry { message, delay }
            }
            RetryDecision::Exhausted { attempts } => {
                registration.stats.record_dead_letter();
                let reason = format!("retries exhausted after {} attempt(s): {}", attempts, err);
                error!(
                    queue = %registration.queue,
                    message_id = %message.id,
                    attempts,
                    error = %err,
                    "job permanently failed"
                );
                Delivery::Dead(DeadLetterEntry::new(message, reason))
            }
            RetryDecision::Disabled => {
                registration.stats.record_dead_letter();
                let reason = format!("retries disabled: {}", err);
                error!(
                    queue = %registration.queue,
                    message_id = %message.id,
                    error = %err,
                    "job failed and retries are disabled"
                );
                Delivery::Dead(DeadLetterEntry::new(message, reason))
            }
        }
    }
}

fn panic_reason(payload: Box<dyn std::any::Any + Send + 'static>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use jobforge_core::RetryPolicy;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            max_retries,
            min_delay: Duration::ZERO,
            max_delay: Duration::from_millis(10),
            exponent: 0.0,
            max_jitter: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn success_completes() {
        let reg = Registration::new("q", 1, Arc::new(handler_fn(|_m| async { Ok(()) })));
        let msg = Message::new("q", b"x".to_vec(), fast_policy(3));

        let delivery = Dispatcher::default().deliver(&reg, msg).await;

        assert!(matches!(delivery, Delivery::Completed));
        assert_eq!(reg.stats.snapshot().succeeded, 1);
    }

    #[tokio::test]
    async fn failure_within_budget_schedules_retry() {
        let reg = Registration::new(
            "q",
            1,
            Arc::new(handler_fn(|_m| async { Err(HandlerError::failed("503 from upstream")) })),
        );
        let msg = Message::new("q", Vec::new(), fast_policy(3));

        match Dispatcher::default().deliver(&reg, msg).await {
            Delivery::Retry { message, delay } => {
                assert_eq!(message.attempt, 1);
                assert_eq!(message.last_error.as_deref(), Some("503 from upstream"));
                assert!(delay <= Duration::from_millis(10));
            }
            other => panic!("expected retry, got {:?}", other),
        }
        assert_eq!(reg.stats.snapshot().retried, 1);
    }

    #[tokio::test]
    async fn failure_past_budget_is_dead_lettered() {
        let reg = Registration::new(
            "q",
            1,
            Arc::new(handler_fn(|_m| async { Err(HandlerError::failed("boom")) })),
        );
        let mut msg = Message::new("q", Vec::new(), fast_policy(1));
        msg.attempt = 1;

        match Dispatcher::default().deliver(&reg, msg).await {
            Delivery::Dead(entry) => {
                assert_eq!(entry.message.attempt, 2);
                assert!(entry.reason.contains("boom"));
            }
            other => panic!("expected dead letter, got {:?}", other),
        }
        assert_eq!(reg.stats.snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn disabled_policy_dead_letters_first_failure() {
        let reg = Registration::new(
            "q",
            1,
            Arc::new(handler_fn(|_m| async { Err(HandlerError::failed("boom")) })),
        );
        let msg = Message::new("q", Vec::new(), RetryPolicy::disabled());

        let delivery = Dispatcher::default().deliver(&reg, msg).await;
        assert!(matches!(
            delivery,
            Delivery::Dead(ref e) if e.reason.starts_with("retries disabled")
        ));
    }

    #[tokio::test]
    async fn panic_is_contained_and_reported() {
        let reg = Registration::new(
            "q",
            1,
            Arc::new(handler_fn(|m: Message| async move {
                if m.is_trigger() {
                    panic!("handler exploded");
                }
                Ok(())
            })),
        );
        let msg = Message::new("q", Vec::new(), fast_policy(2));

        match Dispatcher::default().deliver(&reg, msg).await {
            Delivery::Retry { message, .. } => {
                assert_eq!(
                    message.last_error.as_deref(),
                    Some("handler panicked: handler exploded")
                );
            }
            other => panic!("expected retry, got {:?}", other),
        }
        assert_eq!(reg.stats.snapshot().in_flight, 0);
    }
}
