//! Composition root.
//!
//! Startup order:
//! 1. resolve every configured job against the catalog (unknown names abort)
//! 2. build the queue backend with the logging middleware
//! 3. start one `PeriodicScheduler` per job (registers its handler)
//! 4. start queue dispatch
//!
//! Shutdown reverses it: stop schedulers, wait for their tick loops, then
//! drain the queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use jobforge_config::{Backend, Config, ConfigError};
use jobforge_core::ValidationError;
use jobforge_queue::{
    InMemoryQueue, LoggingMiddleware, MiddlewareChain, QueueClient, RedisQueue, RedisQueueConfig,
    RedisQueueError, StatsSource,
};
use jobforge_scheduler::{PeriodicScheduler, SchedulerError};

use crate::catalog::JobCatalog;

/// Upper bound on waiting for one tick loop to notice `stop`.
const TICK_LOOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Redis(#[from] RedisQueueError),

    #[error("stats server error: {0}")]
    Io(#[from] std::io::Error),
}

/// The queue implementation selected by `worker.backend`.
#[derive(Debug, Clone)]
pub enum QueueBackend {
    Memory(Arc<InMemoryQueue>),
    Redis(Arc<RedisQueue>),
}

impl QueueBackend {
    pub fn from_config(config: &Config, middleware: MiddlewareChain) -> Result<Self, WorkerError> {
        match config.worker.backend {
            Backend::Memory => Ok(Self::Memory(Arc::new(InMemoryQueue::new(middleware)))),
            Backend::Redis => {
                let redis = config.worker.redis.as_ref().ok_or(ConfigError::MissingRedis)?;
                let mut queue_config = RedisQueueConfig::new(&redis.url, &config.app.stack);
                queue_config.pool_size = redis.pool;
                queue_config.connect_timeout = redis.connect_timeout;
                Ok(Self::Redis(Arc::new(RedisQueue::connect(queue_config, middleware)?)))
            }
        }
    }

    pub fn client(&self) -> Arc<dyn QueueClient> {
        match self {
            Self::Memory(q) => q.clone(),
            Self::Redis(q) => q.clone(),
        }
    }

    pub fn stats_source(&self) -> Arc<dyn StatsSource> {
        match self {
            Self::Memory(q) => q.clone(),
            Self::Redis(q) => q.clone(),
        }
    }

    fn start(&self) {
        match self {
            Self::Memory(q) => q.start(),
            Self::Redis(q) => q.start(),
        }
    }

    async fn shutdown(&self) {
        match self {
            Self::Memory(q) => q.shutdown().await,
            Self::Redis(q) => q.shutdown().await,
        }
    }
}

/// A fully wired, running worker.
pub struct Worker {
    config: Config,
    backend: QueueBackend,
    schedulers: Vec<(String, PeriodicScheduler<dyn QueueClient>)>,
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("backend", &self.backend)
            .field("jobs", &self.job_names())
            .finish()
    }
}

impl Worker {
    /// Wire and start everything. Must be called from within a tokio runtime.
    ///
    /// Any error here is a startup defect; schedulers already started are
    /// stopped before it is returned.
    pub fn build(config: Config, catalog: &JobCatalog) -> Result<Self, WorkerError> {
        let policy = config.retry_policy()?;
        let jobs = config
            .job_specs()?
            .into_iter()
            .map(|spec| Ok((catalog.get(&spec.queue_name)?, spec)))
            .collect::<Result<Vec<_>, WorkerError>>()?;

        let middleware = MiddlewareChain::new().with(LoggingMiddleware::new(&config.app.stack));
        let backend = QueueBackend::from_config(&config, middleware)?;
        let client = backend.client();

        let mut schedulers: Vec<(String, PeriodicScheduler<dyn QueueClient>)> =
            Vec::with_capacity(jobs.len());
        for (configure, spec) in jobs {
            let name = spec.queue_name.clone();
            let scheduler = PeriodicScheduler::new(client.clone(), policy.clone(), configure);
            if let Err(e) = scheduler.start(spec) {
                for (_, started) in &schedulers {
                    started.stop();
                }
                return Err(e.into());
            }
            schedulers.push((name, scheduler));
        }

        backend.start();
        info!(
            stack = %config.app.stack,
            jobs = schedulers.len(),
            "worker started"
        );

        Ok(Self {
            config,
            backend,
            schedulers,
        })
    }

    pub fn backend(&self) -> &QueueBackend {
        &self.backend
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.schedulers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Serve stats (when enabled) until `shutdown` resolves, then stop.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()>,
    {
        let stats = &self.config.app.stats;
        let server = if stats.enabled {
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", stats.port)).await?;
            info!("stats listening on {}", listener.local_addr()?);

            let app = crate::stats::router(self.backend.stats_source());
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "stats server stopped");
                }
            }))
        } else {
            None
        };

        shutdown.await;
        info!("shutdown requested");

        if let Some(server) = server {
            server.abort();
        }
        self.shutdown().await;
        Ok(())
    }

    /// Stop ticking, wait for tick loops, drain in-flight deliveries.
    pub async fn shutdown(self) {
        for (_, scheduler) in &self.schedulers {
            scheduler.stop();
        }
        for (name, scheduler) in &self.schedulers {
            if tokio::time::timeout(TICK_LOOP_GRACE, scheduler.join()).await.is_err() {
                warn!(queue = %name, "tick loop still sleeping at shutdown");
            }
        }

        self.backend.shutdown().await;
        info!("worker stopped");
    }
}
