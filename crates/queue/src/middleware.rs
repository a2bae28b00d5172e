//! Execution middleware composed around every handler invocation.
//!
//! Middleware is for cross-cutting concerns (logging, timing). A middleware
//! must hand back the acknowledgment produced by `next` unchanged, and must
//! not catch panics raised below it: those propagate to the dispatcher, which
//! logs them and turns them into a failed delivery.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use jobforge_core::Message;

use crate::handler::{HandlerResult, JobHandler};

/// A wrapper invoked around each delivery.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn call(&self, queue: &str, message: &Message, next: Next<'_>) -> HandlerResult;
}

/// The remainder of the chain below the current middleware.
pub struct Next<'a> {
    queue: &'a str,
    layers: &'a [Arc<dyn Middleware>],
    handler: &'a dyn JobHandler,
}

impl<'a> Next<'a> {
    /// Run the rest of the chain, ending in the handler.
    pub async fn run(self, message: &Message) -> HandlerResult {
        match self.layers.split_first() {
            Some((layer, rest)) => {
                let next = Next {
                    queue: self.queue,
                    layers: rest,
                    handler: self.handler,
                };
                layer.call(self.queue, message, next).await
            }
            None => self.handler.handle(message).await,
        }
    }
}

/// Ordered middleware stack; the first appended is the outermost.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl core::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append<M: Middleware>(&mut self, middleware: M) -> &mut Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    pub fn with<M: Middleware>(mut self, middleware: M) -> Self {
        self.append(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Deliver `message` to `handler` through every layer.
    pub async fn run(
        &self,
        queue: &str,
        message: &Message,
        handler: &dyn JobHandler,
    ) -> HandlerResult {
        Next {
            queue,
            layers: &self.layers,
            handler,
        }
        .run(message)
        .await
    }
}

/// Logs each delivery at debug level, and failures at warn.
#[derive(Debug, Clone)]
pub struct LoggingMiddleware {
    stack: String,
}

impl LoggingMiddleware {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
        }
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn call(&self, queue: &str, message: &Message, next: Next<'_>) -> HandlerResult {
        debug!(
            stack = %self.stack,
            queue,
            message_id = %message.id,
            attempt = message.attempt,
            "executing task"
        );

        let started = Instant::now();
        let result = next.run(message).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => debug!(
                stack = %self.stack,
                queue,
                message_id = %message.id,
                elapsed_ms,
                "task acknowledged"
            ),
            Err(e) => warn!(
                stack = %self.stack,
                queue,
                message_id = %message.id,
                elapsed_ms,
                error = %e,
                "task failed"
            ),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::HandlerError;
    use crate::handler::handler_fn;
    use jobforge_core::RetryPolicy;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recording {
        async fn call(&self, _queue: &str, message: &Message, next: Next<'_>) -> HandlerResult {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            let result = next.run(message).await;
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            result
        }
    }

    #[tokio::test]
    async fn layers_run_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new()
            .with(Recording { name: "a", log: log.clone() })
            .with(Recording { name: "b", log: log.clone() });

        let handler_log = log.clone();
        let handler = handler_fn(move |_msg| {
            let log = handler_log.clone();
            async move {
                log.lock().unwrap().push("handler".to_string());
                Ok(())
            }
        });

        let msg = Message::new("q", Vec::new(), RetryPolicy::default());
        chain.run("q", &msg, &handler).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:before", "b:before", "handler", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn logging_middleware_passes_outcome_through() {
        let chain = MiddlewareChain::new().with(LoggingMiddleware::new("test"));
        let failing = handler_fn(|_msg| async { Err(HandlerError::failed("nope")) });
        let msg = Message::new("q", Vec::new(), RetryPolicy::default());

        assert_eq!(
            chain.run("q", &msg, &failing).await,
            Err(HandlerError::failed("nope"))
        );

        let ok = handler_fn(|_msg| async { Ok(()) });
        assert_eq!(chain.run("q", &msg, &ok).await, Ok(()));
    }

    #[tokio::test]
    async fn empty_chain_calls_handler_directly() {
        let chain = MiddlewareChain::new();
        assert!(chain.is_empty());
        let handler = handler_fn(|msg: Message| async move {
            if msg.is_trigger() { Ok(()) } else { Err(HandlerError::failed("payload")) }
        });
        let msg = Message::new("q", Vec::new(), RetryPolicy::default());
        assert!(chain.run("q", &msg, &handler).await.is_ok());
    }
}
