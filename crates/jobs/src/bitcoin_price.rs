//! Bitcoin Price Index fetch job.
//!
//! Each delivery GETs the configured index endpoint and logs the current
//! rate for one currency, plus the publisher's disclaimer.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use jobforge_core::{JobSpec, Message, ValidationResult};
use jobforge_queue::{HandlerResult, JobHandler};
use jobforge_scheduler::ConfigureHandler;

use crate::http::{FetchError, HttpFetch};

pub const JOB_NAME: &str = "bitcoinPriceIndexFetcher";
pub const API_URL_KEY: &str = "apiUrl";
pub const CURRENCY_KEY: &str = "currency";
pub const DEFAULT_CURRENCY: &str = "USD";

/// Index document. Unknown fields are ignored; only `time.updated`, the
/// selected rate and the disclaimer are ever logged.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BitcoinPriceIndex {
    #[serde(default)]
    pub time: PriceTime,
    #[serde(default)]
    pub disclaimer: String,
    #[serde(default)]
    pub chart_name: String,
    /// Keyed by currency code (`USD`, `GBP`, `EUR`).
    #[serde(default)]
    pub bpi: BTreeMap<String, CurrencyRate>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PriceTime {
    #[serde(default)]
    pub updated: String,
    #[serde(default, rename = "updatedISO")]
    pub updated_iso: Option<String>,
    #[serde(default)]
    pub updateduk: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CurrencyRate {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub rate: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rate_float: Option<f64>,
}

impl BitcoinPriceIndex {
    pub fn rate(&self, currency: &str) -> Option<&CurrencyRate> {
        self.bpi.get(currency)
    }
}

/// Handler bound to one endpoint and currency.
pub struct BitcoinPriceIndexFetcher {
    fetcher: Arc<dyn HttpFetch>,
    api_url: String,
    currency: String,
}

impl core::fmt::Debug for BitcoinPriceIndexFetcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BitcoinPriceIndexFetcher")
            .field("api_url", &self.api_url)
            .field("currency", &self.currency)
            .finish_non_exhaustive()
    }
}

impl BitcoinPriceIndexFetcher {
    pub fn new(
        fetcher: Arc<dyn HttpFetch>,
        api_url: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            api_url: api_url.into(),
            currency: currency.into(),
        }
    }

    /// Fetch and log the index.
    ///
    /// Returns `Ok(None)` when the endpoint answered with an empty body; that
    /// is logged as an anomaly but is not a failure, so it is not retried.
    pub async fn fetch(&self) -> Result<Option<BitcoinPriceIndex>, FetchError> {
        let resp = self.fetcher.get(&self.api_url).await?;
        if !resp.is_success() {
            return Err(FetchError::UnexpectedStatus(resp.status));
        }

        if resp.body.iter().all(u8::is_ascii_whitespace) {
            warn!(api_url = %self.api_url, "response has no body");
            return Ok(None);
        }

        let index: BitcoinPriceIndex = serde_json::from_slice(&resp.body)?;
        let rate = index
            .rate(&self.currency)
            .ok_or_else(|| FetchError::MissingCurrency(self.currency.clone()))?;

        info!(
            "On {} Bitcoin value is worth {} {}",
            index.time.updated, rate.rate, rate.code
        );
        if !index.disclaimer.is_empty() {
            warn!("{}", index.disclaimer);
        }

        Ok(Some(index))
    }
}

#[async_trait]
impl JobHandler for BitcoinPriceIndexFetcher {
    async fn handle(&self, _message: &Message) -> HandlerResult {
        self.fetch().await?;
        Ok(())
    }
}

/// Builds [`BitcoinPriceIndexFetcher`]s from job metadata.
///
/// `apiUrl` is required; `currency` defaults to `USD`.
#[derive(Clone)]
pub struct BitcoinPriceIndexJob {
    fetcher: Arc<dyn HttpFetch>,
}

impl BitcoinPriceIndexJob {
    pub fn new(fetcher: Arc<dyn HttpFetch>) -> Self {
        Self { fetcher }
    }
}

impl ConfigureHandler for BitcoinPriceIndexJob {
    fn configure(&self, spec: &JobSpec) -> ValidationResult<Arc<dyn JobHandler>> {
        let api_url = spec.required_metadata(API_URL_KEY)?;
        let currency = spec
            .optional_metadata(CURRENCY_KEY)
            .unwrap_or(DEFAULT_CURRENCY)
            .to_ascii_uppercase();

        Ok(Arc::new(BitcoinPriceIndexFetcher::new(
            self.fetcher.clone(),
            api_url,
            currency,
        )))
    }
}
