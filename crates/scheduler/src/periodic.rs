use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use jobforge_core::{JobSpec, RetryPolicy, ValidationResult};
use jobforge_queue::{JobHandler, QueueClient};

use crate::error::SchedulerError;

/// Builds a job's handler from its metadata.
///
/// Called once by [`PeriodicScheduler::start`]. A missing required key must
/// surface as an error here rather than fall back to a default.
pub trait ConfigureHandler: Send + Sync + 'static {
    fn configure(&self, spec: &JobSpec) -> ValidationResult<Arc<dyn JobHandler>>;
}

impl<F> ConfigureHandler for F
where
    F: Fn(&JobSpec) -> ValidationResult<Arc<dyn JobHandler>> + Send + Sync + 'static,
{
    fn configure(&self, spec: &JobSpec) -> ValidationResult<Arc<dyn JobHandler>> {
        (self)(spec)
    }
}

/// Drives one job: registers its handler, then enqueues a trigger per tick.
///
/// ## Lifecycle
///
/// `Idle --start--> Running --stop--> Finished`. Starting a running instance
/// returns [`SchedulerError::AlreadyStarted`] and leaves it as is; starting a
/// finished one returns [`SchedulerError::Finished`]. `stop` is idempotent
/// and cooperative: a sleep in progress is not interrupted, so at most one
/// more tick may land after it returns.
pub struct PeriodicScheduler<Q: QueueClient + ?Sized> {
    queue: Arc<Q>,
    retry_policy: RetryPolicy,
    configure: Arc<dyn ConfigureHandler>,
    started: AtomicBool,
    stopped: AtomicBool,
    running: Arc<AtomicBool>,
    tick_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<Q: QueueClient + ?Sized> core::fmt::Debug for PeriodicScheduler<Q> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeriodicScheduler")
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<Q: QueueClient + ?Sized> PeriodicScheduler<Q> {
    pub fn new(
        queue: Arc<Q>,
        retry_policy: RetryPolicy,
        configure: Arc<dyn ConfigureHandler>,
    ) -> Self {
        Self {
            queue,
            retry_policy,
            configure,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            tick_loop: Mutex::new(None),
        }
    }

    /// Configure the handler, register it, and spawn the tick loop when the
    /// job is enabled.
    ///
    /// Must be called from within a tokio runtime. A disabled job is still
    /// registered so queued messages from other producers get handled.
    pub fn start(&self, spec: JobSpec) -> Result<(), SchedulerError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(SchedulerError::Finished(spec.queue_name));
            }
            return Err(SchedulerError::AlreadyStarted(spec.queue_name));
        }

        if let Err(e) = self.wire(&spec) {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.running.store(spec.enabled, Ordering::SeqCst);
        if !spec.enabled {
            info!(queue = %spec.queue_name, "job disabled, tick loop not started");
            return Ok(());
        }

        info!(
            queue = %spec.queue_name,
            period_ms = spec.period.as_millis() as u64,
            concurrency = spec.concurrency,
            "job scheduled"
        );

        let handle = tokio::spawn(tick_loop(
            self.queue.clone(),
            spec,
            self.retry_policy.clone(),
            self.running.clone(),
        ));
        *self.tick_loop.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    fn wire(&self, spec: &JobSpec) -> Result<(), SchedulerError> {
        spec.validate()?;
        let handler = self.configure.configure(spec)?;
        self.queue
            .register(&spec.queue_name, spec.concurrency, handler)?;
        Ok(())
    }

    /// Ask the tick loop to exit on its next wake.
    pub fn stop(&self) {
        if self.started.load(Ordering::SeqCst) {
            self.stopped.store(true, Ordering::SeqCst);
        }
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("scheduler stop requested");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait for the tick loop to exit. Returns immediately if none was spawned.
    pub async fn join(&self) {
        let handle = self
            .tick_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "tick loop terminated abnormally");
            }
        }
    }
}

async fn tick_loop<Q: QueueClient + ?Sized>(
    queue: Arc<Q>,
    spec: JobSpec,
    policy: RetryPolicy,
    running: Arc<AtomicBool>,
) {
    loop {
        if spec.period.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(spec.period).await;
        }

        if !running.load(Ordering::SeqCst) {
            break;
        }

        match queue.enqueue(&spec.queue_name, Vec::new(), &policy).await {
            Ok(id) => debug!(queue = %spec.queue_name, message_id = %id, "job enqueued"),
            Err(e) => error!(queue = %spec.queue_name, error = %e, "failed to enqueue job"),
        }
    }

    info!(queue = %spec.queue_name, "tick loop stopped");
}
