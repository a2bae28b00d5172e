//! Job names the worker knows how to run.

use std::collections::BTreeMap;
use std::sync::Arc;

use jobforge_config::ConfigError;
use jobforge_jobs::{BitcoinPriceIndexJob, HttpFetch, bitcoin_price};
use jobforge_scheduler::ConfigureHandler;

/// Maps configured job names to the factory that builds their handler.
///
/// A job in the configuration with no catalog entry aborts startup.
#[derive(Clone, Default)]
pub struct JobCatalog {
    entries: BTreeMap<String, Arc<dyn ConfigureHandler>>,
}

impl core::fmt::Debug for JobCatalog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobCatalog")
            .field("jobs", &self.names())
            .finish()
    }
}

impl JobCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job shipped with the worker.
    pub fn standard(fetcher: Arc<dyn HttpFetch>) -> Self {
        Self::new().with_job(bitcoin_price::JOB_NAME, BitcoinPriceIndexJob::new(fetcher))
    }

    pub fn with_job<C: ConfigureHandler>(mut self, name: impl Into<String>, configure: C) -> Self {
        self.entries.insert(name.into(), Arc::new(configure));
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ConfigureHandler>, ConfigError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownJob(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_jobs::ReqwestFetcher;
    use std::time::Duration;

    #[test]
    fn standard_catalog_knows_bitcoin_job() {
        let fetcher = Arc::new(ReqwestFetcher::new(Duration::from_secs(1)).unwrap());
        let catalog = JobCatalog::standard(fetcher);

        assert_eq!(catalog.names(), vec!["bitcoinPriceIndexFetcher"]);
        assert!(catalog.get("bitcoinPriceIndexFetcher").is_ok());
        assert!(matches!(
            catalog.get("ethereum"),
            Err(ConfigError::UnknownJob(ref name)) if name == "ethereum"
        ));
    }
}
