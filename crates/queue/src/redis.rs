//! Redis-backed queue (durable, at-least-once delivery).
//!
//! ## Key layout (under the configured namespace `ns`)
//!
//! - `{ns}:queues`: set of known queue names
//! - `{ns}:queue:{name}`: list of pending messages
//! - `{ns}:processing:{name}`: list of messages claimed by a dispatch loop
//! - `{ns}:retry`: sorted set of failed messages, scored by due unix time
//! - `{ns}:dead`: sorted set of dead-letter entries, scored by failure time
//!
//! A dispatch loop claims work with `BRPOPLPUSH` into the processing list and
//! removes the claim only after the delivery outcome is persisted, in the
//! same `MULTI` block. Entries left in a processing list by a crashed worker
//! are pushed back onto the queue when dispatch starts, so a message may be
//! delivered more than once but is never dropped. Due retries move back onto
//! their queue through a Lua script, so the claim and the push are one step.
//!
//! Messages are stored as JSON-encoded [`Message`] values, so the retry
//! policy and attempt count travel with each message across processes.
//!
//! The `redis` client is synchronous; every command runs on tokio's blocking
//! pool so dispatch loops never stall the async runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use jobforge_core::{Message, MessageId, RetryPolicy};

use crate::client::{QueueClient, validate_registration};
use crate::dispatch::{DeadLetterEntry, Delivery, Dispatcher, Registration};
use crate::error::{EnqueueError, RegisterError};
use crate::handler::JobHandler;
use crate::middleware::MiddlewareChain;
use crate::stats::{QueueStatsSnapshot, StatsSource};

/// Max retry entries moved back per poll.
const RETRY_BATCH: usize = 100;

/// KEYS[1] = retry zset, KEYS[2] = queue list, ARGV[1] = message.
static REQUEUE_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
            redis.call('LPUSH', KEYS[2], ARGV[1])
            return 1
        end
        return 0
        ",
    )
});

/// KEYS[1] = retry zset, KEYS[2] = dead zset, ARGV[1] = member, ARGV[2] = score.
static BURY_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
            redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
            return 1
        end
        return 0
        ",
    )
});

#[derive(Debug, thiserror::Error)]
pub enum RedisQueueError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),
}

#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Key prefix shared by every queue of this deployment.
    pub namespace: String,
    /// Idle connections kept for reuse.
    pub pool_size: usize,
    /// Upper bound on establishing a connection (bounds `enqueue`).
    pub connect_timeout: Duration,
    /// How long a dispatch loop blocks waiting for work.
    pub fetch_timeout: Duration,
    /// How often due retries are moved back onto their queues.
    pub retry_poll_interval: Duration,
}

impl RedisQueueConfig {
    pub fn new(url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: namespace.into(),
            pool_size: 10,
            connect_timeout: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(1),
            retry_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Contents of the dead-letter set.
#[derive(Debug, Clone, Default)]
pub struct DeadLetters {
    /// Messages that exhausted their retry policy, oldest first.
    pub entries: Vec<DeadLetterEntry>,
    /// Raw members that were parked because they could not be decoded.
    pub undecodable: Vec<String>,
}

#[derive(Debug, Clone)]
struct Keys {
    namespace: String,
}

impl Keys {
    fn queues(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    fn queue(&self, name: &str) -> String {
        format!("{}:queue:{}", self.namespace, name)
    }

    fn processing(&self, name: &str) -> String {
        format!("{}:processing:{}", self.namespace, name)
    }

    fn retry(&self) -> String {
        format!("{}:retry", self.namespace)
    }

    fn dead(&self) -> String {
        format!("{}:dead", self.namespace)
    }
}

/// Small cache of idle connections.
///
/// A connection that failed a command is dropped instead of returned.
struct ConnectionPool {
    client: redis::Client,
    idle: Mutex<Vec<redis::Connection>>,
    max_idle: usize,
    connect_timeout: Duration,
}

impl ConnectionPool {
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, RedisQueueError> {
        let pooled = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self
                .client
                .get_connection_with_timeout(self.connect_timeout)
                .map_err(|e| RedisQueueError::Connection(e.to_string()))?,
        };

        let result = f(&mut conn).map_err(|e| RedisQueueError::Command(e.to_string()))?;

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
        Ok(result)
    }

    /// Run `f` on the blocking pool.
    async fn run<T, F>(self: &Arc<Self>, f: F) -> Result<T, RedisQueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.with_connection(f))
            .await
            .map_err(|e| RedisQueueError::Command(e.to_string()))?
    }
}

struct Inner {
    config: RedisQueueConfig,
    keys: Keys,
    pool: Arc<ConnectionPool>,
    dispatcher: Dispatcher,
    registry: RwLock<HashMap<String, Arc<Registration>>>,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Redis implementation of [`QueueClient`].
#[derive(Clone)]
pub struct RedisQueue {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("namespace", &self.inner.keys.namespace)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    /// Open the client and verify the server is reachable.
    ///
    /// An unreachable server at startup is a fatal transport error.
    pub fn connect(
        config: RedisQueueConfig,
        middleware: MiddlewareChain,
    ) -> Result<Self, RedisQueueError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| RedisQueueError::Connection(e.to_string()))?;

        let pool = Arc::new(ConnectionPool {
            client,
            idle: Mutex::new(Vec::new()),
            max_idle: config.pool_size.max(1),
            connect_timeout: config.connect_timeout,
        });
        pool.with_connection(|conn| redis::cmd("PING").query::<String>(conn))?;

        let (shutdown, _) = watch::channel(false);
        info!(namespace = %config.namespace, "connected to redis");

        Ok(Self {
            inner: Arc::new(Inner {
                keys: Keys {
                    namespace: config.namespace.clone(),
                },
                config,
                pool,
                dispatcher: Dispatcher::new(middleware),
                registry: RwLock::new(HashMap::new()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown,
                loops: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawn one dispatch loop per registered queue plus the retry poller.
    ///
    /// Each loop first requeues whatever its processing list still holds. When
    /// several workers share a namespace, a restart can therefore redeliver a
    /// message another worker is still handling.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut loops = self.inner.loops.lock().unwrap_or_else(PoisonError::into_inner);

        for registration in registry.values() {
            info!(
                queue = %registration.queue,
                concurrency = registration.concurrency,
                "queue dispatch started"
            );
            loops.push(tokio::spawn(dispatch_loop(
                self.inner.clone(),
                registration.clone(),
                self.inner.shutdown.subscribe(),
            )));
        }
        loops.push(tokio::spawn(retry_poller(
            self.inner.clone(),
            self.inner.shutdown.subscribe(),
        )));
    }

    /// Stop fetching and wait for in-flight deliveries to finish.
    ///
    /// Pending retries stay in Redis and are picked up by the next worker.
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
        info!("queue stopped");
    }

    /// Everything in the dead-letter set, oldest first.
    pub async fn dead_letters(&self) -> Result<DeadLetters, RedisQueueError> {
        let key = self.inner.keys.dead();
        let raw = self
            .inner
            .pool
            .run(move |conn| {
                redis::cmd("ZRANGE")
                    .arg(&key)
                    .arg(0)
                    .arg(-1)
                    .query::<Vec<String>>(conn)
            })
            .await?;

        let mut dead = DeadLetters::default();
        for member in raw {
            match serde_json::from_str::<DeadLetterEntry>(&member) {
                Ok(entry) => dead.entries.push(entry),
                Err(_) => dead.undecodable.push(member),
            }
        }
        Ok(dead)
    }
}

#[async_trait]
impl QueueClient for RedisQueue {
    fn register(
        &self,
        queue: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegisterError> {
        validate_registration(queue, concurrency)?;

        let mut registry = self.inner.registry.write().unwrap_or_else(PoisonError::into_inner);
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(RegisterError::DispatchStarted(queue.to_string()));
        }
        if registry.contains_key(queue) {
            return Err(RegisterError::Duplicate(queue.to_string()));
        }
        registry.insert(
            queue.to_string(),
            Arc::new(Registration::new(queue, concurrency, handler)),
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

        let registration = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
            .ok_or_else(|| EnqueueError::UnknownQueue(queue.to_string()))?;

        let message = Message::new(queue, payload, retry_policy.clone());
        let id = message.id;
        let raw = serde_json::to_string(&message)
            .map_err(|e| EnqueueError::Serialization(e.to_string()))?;

        let queues_key = self.inner.keys.queues();
        let queue_key = self.inner.keys.queue(queue);
        let name = queue.to_string();

        self.inner
            .pool
            .run(move |conn| {
                redis::pipe()
                    .atomic()
                    .cmd("SADD")
                    .arg(&queues_key)
                    .arg(&name)
                    .ignore()
                    .cmd("LPUSH")
                    .arg(&queue_key)
                    .arg(&raw)
                    .ignore()
                    .query::<()>(conn)
            })
            .await
            .map_err(|e| EnqueueError::Transport(e.to_string()))?;

        registration.stats.record_enqueued();
        debug!(queue, message_id = %id, "message enqueued");
        Ok(id)
    }
}

impl StatsSource for RedisQueue {
    fn stats(&self) -> BTreeMap<String, QueueStatsSnapshot> {
        let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .iter()
            .map(|(name, reg)| (name.clone(), reg.stats.snapshot()))
            .collect()
    }
}

async fn dispatch_loop(
    inner: Arc<Inner>,
    registration: Arc<Registration>,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(registration.concurrency));
    let mut in_flight = JoinSet::new();
    let queue_key = inner.keys.queue(&registration.queue);
    let processing_key = inner.keys.processing(&registration.queue);
    let fetch_timeout = inner.config.fetch_timeout;

    let (from, to) = (processing_key.clone(), queue_key.clone());
    match inner.pool.run(move |conn| recover_claimed(conn, &from, &to)).await {
        Ok(0) => {}
        Ok(n) => warn!(
            queue = %registration.queue,
            recovered = n,
            "requeued orphaned messages"
        ),
        Err(e) => error!(queue = %registration.queue, error = %e, "orphan recovery failed"),
    }

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

        let (from, to) = (queue_key.clone(), processing_key.clone());
        let fetched = inner
            .pool
            .run(move |conn| claim(conn, &from, &to, fetch_timeout))
            .await;
        let claimed = match fetched {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                error!(queue = %registration.queue, error = %e, "failed to fetch from redis");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(fetch_timeout) => continue,
                }
            }
        };

        let message: Message = match serde_json::from_str(&claimed) {
            Ok(m) => m,
            Err(e) => {
                error!(queue = %registration.queue, error = %e, "parking undecodable message");
                park_undecodable(&inner, &registration.queue, claimed).await;
                continue;
            }
        };

        let inner = inner.clone();
        let registration = registration.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            let delivery = inner.dispatcher.deliver(&registration, message).await;
            settle(&inner, &registration.queue, claimed, delivery).await;
        });

        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
    debug!(queue = %registration.queue, "dispatch loop stopped");
}

/// Atomically move the oldest pending message into the processing list.
fn claim(
    conn: &mut redis::Connection,
    queue_key: &str,
    processing_key: &str,
    timeout: Duration,
) -> redis::RedisResult<Option<String>> {
    let secs = timeout.as_secs().max(1);
    conn.set_read_timeout(Some(Duration::from_secs(secs + 2)))?;
    redis::cmd("BRPOPLPUSH")
        .arg(queue_key)
        .arg(processing_key)
        .arg(secs)
        .query(conn)
}

/// Push every claimed-but-unsettled message back onto its queue.
fn recover_claimed(
    conn: &mut redis::Connection,
    processing_key: &str,
    queue_key: &str,
) -> redis::RedisResult<usize> {
    let pending: usize = redis::cmd("LLEN").arg(processing_key).query(conn)?;
    let mut moved = 0;
    for _ in 0..pending {
        let raw: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(processing_key)
            .arg(queue_key)
            .query(conn)?;
        if raw.is_none() {
            break;
        }
        moved += 1;
    }
    Ok(moved)
}

/// Persist the outcome and release the claim in one `MULTI` block.
///
/// If this fails the message stays in the processing list and is redelivered
/// on the next start.
async fn settle(inner: &Arc<Inner>, queue: &str, claimed: String, delivery: Delivery) {
    let outcome = match delivery {
        Delivery::Completed => None,
        Delivery::Retry { message, delay } => {
            let due = unix_now() + delay.as_secs_f64();
            match serde_json::to_string(&message) {
                Ok(raw) => Some((inner.keys.retry(), due, raw)),
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "failed to encode retry");
                    return;
                }
            }
        }
        Delivery::Dead(entry) => match serde_json::to_string(&entry) {
            Ok(raw) => Some((inner.keys.dead(), unix_now(), raw)),
            Err(e) => {
                let id = entry.message.id;
                error!(message_id = %id, error = %e, "failed to encode dead letter");
                return;
            }
        },
    };

    let processing_key = inner.keys.processing(queue);
    let stored = inner
        .pool
        .run(move |conn| {
            let mut pipe = redis::pipe();
            pipe.atomic();
            if let Some((key, score, member)) = &outcome {
                pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
            }
            pipe.cmd("LREM")
                .arg(&processing_key)
                .arg(1)
                .arg(&claimed)
                .ignore()
                .query::<()>(conn)
        })
        .await;

    if let Err(e) = stored {
        error!(queue, error = %e, "failed to persist outcome; message stays claimed");
    }
}

async fn park_undecodable(inner: &Arc<Inner>, queue: &str, raw: String) {
    let dead_key = inner.keys.dead();
    let processing_key = inner.keys.processing(queue);
    let score = unix_now();

    let parked = inner
        .pool
        .run(move |conn| {
            redis::pipe()
                .atomic()
                .cmd("ZADD")
                .arg(&dead_key)
                .arg(score)
                .arg(&raw)
                .ignore()
                .cmd("LREM")
                .arg(&processing_key)
                .arg(1)
                .arg(&raw)
                .ignore()
                .query::<()>(conn)
        })
        .await;

    if let Err(e) = parked {
        error!(queue, error = %e, "failed to park undecodable message; it stays claimed");
    }
}

async fn retry_poller(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let interval = inner.config.retry_poll_interval;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let keys = inner.keys.clone();
        match inner.pool.run(move |conn| move_due_retries(conn, &keys, unix_now())).await {
            Ok(0) => {}
            Ok(n) => debug!(moved = n, "requeued due retries"),
            Err(e) => warn!(error = %e, "retry poll failed"),
        }
    }
}

fn move_due_retries(
    conn: &mut redis::Connection,
    keys: &Keys,
    now: f64,
) -> redis::RedisResult<usize> {
    let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
        .arg(keys.retry())
        .arg("-inf")
        .arg(now)
        .arg("LIMIT")
        .arg(0)
        .arg(RETRY_BATCH)
        .query(conn)?;

    let mut moved = 0;
    for raw in due {
        // A zero result means another worker claimed it first.
        match serde_json::from_str::<Message>(&raw) {
            Ok(message) => {
                let claimed: i64 = REQUEUE_SCRIPT
                    .key(keys.retry())
                    .key(keys.queue(&message.queue))
                    .arg(&raw)
                    .invoke(conn)?;
                moved += usize::from(claimed == 1);
            }
            Err(_) => {
                BURY_SCRIPT
                    .key(keys.retry())
                    .key(keys.dead())
                    .arg(&raw)
                    .arg(now)
                    .invoke::<i64>(conn)?;
            }
        }
    }
    Ok(moved)
}

fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
