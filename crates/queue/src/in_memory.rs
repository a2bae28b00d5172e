//! In-process queue backend.
//!
//! - Registration table is write-once at startup, read-many afterwards
//! - `start()` spawns one dispatch loop per queue; later registrations fail
//! - Messages enqueued before `start()` are buffered, not lost
//! - Failed deliveries are redelivered after the policy's backoff delay
//! - Permanently failed messages land in an in-memory dead-letter list
//! - Both the pending buffer and the dead-letter list are bounded by
//!   [`QueueLimits`]; a full queue rejects `enqueue` with `EnqueueError::Full`
//!   and the oldest dead letter is evicted first
//!
//! Nothing here survives a process restart; use the Redis backend when the
//! queue must outlive the worker.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use jobforge_core::{Message, MessageId, RetryPolicy};

use crate::client::{QueueClient, validate_registration};
use crate::dispatch::{DeadLetterEntry, Delivery, Dispatcher, Registration};
use crate::error::{EnqueueError, RegisterError};
use crate::handler::JobHandler;
use crate::middleware::MiddlewareChain;
use crate::stats::{QueueStatsSnapshot, StatsSource};

/// Capacity bounds for an [`InMemoryQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Messages buffered per queue, pending retries included.
    pub pending: usize,
    /// Dead-letter entries kept across all queues.
    pub dead_letters: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            pending: 10_000,
            dead_letters: 1_000,
        }
    }
}

struct QueueSlot {
    registration: Arc<Registration>,
    sender: mpsc::Sender<Message>,
    receiver: Option<mpsc::Receiver<Message>>,
}

struct Inner {
    limits: QueueLimits,
    dispatcher: Dispatcher,
    queues: RwLock<HashMap<String, QueueSlot>>,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    dead_letters: Mutex<VecDeque<DeadLetterEntry>>,
    pending_retries: AtomicUsize,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// In-memory implementation of [`QueueClient`].
///
/// Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(MiddlewareChain::new())
    }
}

impl InMemoryQueue {
    pub fn new(middleware: MiddlewareChain) -> Self {
        Self::with_limits(middleware, QueueLimits::default())
    }

    pub fn with_limits(middleware: MiddlewareChain, limits: QueueLimits) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                limits,
                dispatcher: Dispatcher::new(middleware),
                queues: RwLock::new(HashMap::new()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown,
                dead_letters: Mutex::new(VecDeque::new()),
                pending_retries: AtomicUsize::new(0),
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start dispatching. Must be called from within a tokio runtime.
    ///
    /// Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut queues = self
            .inner
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut loops = self.inner.loops.lock().unwrap_or_else(PoisonError::into_inner);

        for slot in queues.values_mut() {
            let Some(receiver) = slot.receiver.take() else {
                continue;
            };
            info!(
                queue = %slot.registration.queue,
                concurrency = slot.registration.concurrency,
                "queue dispatch started"
            );
            loops.push(tokio::spawn(dispatch_loop(
                self.inner.clone(),
                slot.registration.clone(),
                slot.sender.clone(),
                receiver,
                self.inner.shutdown.subscribe(),
            )));
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Stop dispatching and wait for in-flight deliveries to finish.
    ///
    /// New enqueues are rejected from this point on. Retries still waiting on
    /// their backoff timer are dropped.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);

        let loops: Vec<_> = self
            .inner
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in loops {
            let _ = handle.await;
        }

        let dropped = self.inner.pending_retries.load(Ordering::SeqCst);
        if dropped > 0 {
            warn!(dropped, "queue shut down with retries still pending");
        }
        info!("queue stopped");
    }

    /// Messages that permanently failed, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.inner
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let queues = self.inner.queues.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = queues.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    fn register(
        &self,
        queue: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegisterError> {
        validate_registration(queue, concurrency)?;

        let mut queues = self
            .inner
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if self.inner.started.load(Ordering::SeqCst) {
            return Err(RegisterError::DispatchStarted(queue.to_string()));
        }
        if queues.contains_key(queue) {
            return Err(RegisterError::Duplicate(queue.to_string()));
        }

        let (sender, receiver) = mpsc::channel(self.inner.limits.pending.max(1));
        queues.insert(
            queue.to_string(),
            QueueSlot {
                registration: Arc::new(Registration::new(queue, concurrency, handler)),
                sender,
                receiver: Some(receiver),
            },
        );

        debug!(queue, concurrency, "queue registered");
        Ok(())
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        retry_policy: &RetryPolicy,
    ) -> Result<MessageId, EnqueueError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EnqueueError::Closed(queue.to_string()));
        }

        let queues = self.inner.queues.read().unwrap_or_else(PoisonError::into_inner);
        let slot = queues
            .get(queue)
            .ok_or_else(|| EnqueueError::UnknownQueue(queue.to_string()))?;

        let message = Message::new(queue, payload, retry_policy.clone());
        let id = message.id;
        slot.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full(queue.to_string()),
            TrySendError::Closed(_) => EnqueueError::Closed(queue.to_string()),
        })?;
        slot.registration.stats.record_enqueued();

        debug!(queue, message_id = %id, "message enqueued");
        Ok(id)
    }
}

impl StatsSource for InMemoryQueue {
    fn stats(&self) -> BTreeMap<String, QueueStatsSnapshot> {
        let queues = self.inner.queues.read().unwrap_or_else(PoisonError::into_inner);
        queues
            .iter()
            .map(|(name, slot)| (name.clone(), slot.registration.stats.snapshot()))
            .collect()
    }
}

async fn dispatch_loop(
    inner: Arc<Inner>,
    registration: Arc<Registration>,
    redeliver: mpsc::Sender<Message>,
    mut receiver: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(registration.concurrency));
    let mut in_flight = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let message = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            message = receiver.recv() => match message {
                Some(m) => m,
                None => break,
            },
        };

        let inner = inner.clone();
        let registration = registration.clone();
        let redeliver = redeliver.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            let delivery = inner.dispatcher.deliver(&registration, message).await;
            settle(&inner, delivery, redeliver);
        });

        while in_flight.try_join_next().is_some() {}
    }

    // Graceful drain: let in-flight deliveries finish.
    while in_flight.join_next().await.is_some() {}
    debug!(queue = %registration.queue, "dispatch loop stopped");
}

fn settle(inner: &Arc<Inner>, delivery: Delivery, redeliver: mpsc::Sender<Message>) {
    match delivery {
        Delivery::Completed => {}
        Delivery::Retry { message, delay } => {
            let mut shutdown = inner.shutdown.subscribe();
            let inner = inner.clone();
            inner.pending_retries.fetch_add(1, Ordering::SeqCst);
            let (id, queue) = (message.id, message.queue.clone());
            tokio::spawn(async move {
                let redeliver_after_delay = async {
                    tokio::time::sleep(delay).await;
                    redeliver.send(message).await
                };
                tokio::select! {
                    sent = redeliver_after_delay => {
                        if sent.is_err() {
                            warn!("retry dropped: queue receiver is gone");
                        }
                        inner.pending_retries.fetch_sub(1, Ordering::SeqCst);
                    }
                    _ = shutdown.wait_for(|stop| *stop) => {
                        warn!(
                            message_id = %id,
                            queue = %queue,
                            "pending retry dropped on shutdown"
                        );
                    }
                }
            });
        }
        Delivery::Dead(entry) => {
            let mut dead = inner.dead_letters.lock().unwrap_or_else(PoisonError::into_inner);
            if dead.len() >= inner.limits.dead_letters.max(1) {
                if let Some(evicted) = dead.pop_front() {
                    let id = evicted.message.id;
                    warn!(message_id = %id, "dead-letter list full, evicting oldest");
                }
            }
            dead.push_back(entry);
        }
    }
}
