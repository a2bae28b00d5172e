//! Concrete jobs runnable by the worker.
//!
//! Each job exposes a `ConfigureHandler` that reads the job's metadata and
//! builds its `JobHandler`. External calls go through [`HttpFetch`] so the
//! handlers can be exercised without a network.

pub mod bitcoin_price;
pub mod http;

pub use bitcoin_price::{
    BitcoinPriceIndex, BitcoinPriceIndexFetcher, BitcoinPriceIndexJob, CurrencyRate, PriceTime,
};
pub use http::{FetchError, HttpFetch, HttpResponse, ReqwestFetcher};
