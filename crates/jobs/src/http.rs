//! HTTP fetch capability.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use jobforge_queue::HandlerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("external API returned an unexpected status code {0}")]
    UnexpectedStatus(u16),

    #[error("malformed response body: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("response carries no `{0}` rate")]
    MissingCurrency(String),
}

impl From<FetchError> for HandlerError {
    fn from(e: FetchError) -> Self {
        HandlerError::failed(e.to_string())
    }
}

/// Minimal GET capability used by job handlers.
#[async_trait]
pub trait HttpFetch: Send + Sync + 'static {
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError>;
}

#[async_trait]
impl<T> HttpFetch for Arc<T>
where
    T: HttpFetch + ?Sized,
{
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError> {
        (**self).get(url).await
    }
}

/// `reqwest`-backed fetcher with a per-request timeout.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let transport = |e: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let resp = self.client.get(url).send().await.map_err(transport)?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(transport)?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}
