use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use jobforge_jobs::ReqwestFetcher;
use jobforge_observability::LogOptions;
use jobforge_worker::{JobCatalog, Worker};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = jobforge_config::load_from_env().context("failed to load configuration")?;

    jobforge_observability::init(LogOptions {
        verbose: config.app.logging.verbose,
        json: config.app.logging.log_json,
    });

    let fetcher = ReqwestFetcher::new(HTTP_TIMEOUT).context("failed to build http client")?;
    let catalog = JobCatalog::standard(Arc::new(fetcher));

    let worker = Worker::build(config, &catalog).context("failed to start worker")?;
    worker.run_until(shutdown_signal()).await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
