//! Worker configuration.
//!
//! A single YAML document read once at process start. Everything is
//! validated at load time, so a `Config` that exists is safe to wire up.
//!
//! - Path: `./config/config.yaml`, overridden by `JOBFORGE_CONFIG`
//! - Retry delays are whole seconds
//! - `period` and `connectTimeout` are humantime strings (`30s`, `1m 30s`)

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use jobforge_core::{JobSpec, RetryPolicy, ValidationResult};

mod duration;
pub mod error;

pub use error::ConfigError;

pub const DEFAULT_PATH: &str = "./config/config.yaml";
pub const CONFIG_ENV: &str = "JOBFORGE_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppConfig {
    /// Namespace for queue keys and log context.
    #[serde(default = "default_stack")]
    pub stack: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            stack: default_stack(),
            logging: LoggingConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    /// 0 = error, 1 = warn, 2 = info, 3 = debug.
    #[serde(default = "default_verbose")]
    pub verbose: u8,
    #[serde(default, rename = "logJSON", alias = "logJson")]
    pub log_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            verbose: default_verbose(),
            log_json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_stats_port")]
    pub port: u16,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_stats_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub backend: Backend,
    pub retry: RetryConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    /// Keyed by job name, which doubles as the queue name.
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

/// Retry block shared by every job. Required; only `enabled` and `maxRand`
/// may be omitted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub max_delay: u64,
    pub min_delay: u64,
    pub retry_max: u32,
    pub exp: f64,
    #[serde(default)]
    pub max_rand: u64,
}

impl RetryConfig {
    pub fn to_policy(&self) -> ValidationResult<RetryPolicy> {
        RetryPolicy::new(
            self.enabled,
            self.retry_max,
            Duration::from_secs(self.min_delay),
            Duration::from_secs(self.max_delay),
            self.exp,
            Duration::from_secs(self.max_rand),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_pool")]
    pub pool: usize,
    #[serde(default = "default_connect_timeout", with = "duration")]
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub enabled: bool,
    pub concurrency: usize,
    #[serde(with = "duration")]
    pub period: Duration,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl JobConfig {
    pub fn to_spec(&self, name: &str) -> ValidationResult<JobSpec> {
        let mut spec = JobSpec::new(name, self.concurrency, self.period, self.enabled)?;
        spec.metadata = self.metadata.clone();
        Ok(spec)
    }
}

impl Config {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject anything the worker could not start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app.stack.trim().is_empty() {
            return Err(ConfigError::invalid("app.stack must not be empty"));
        }
        if self.app.stats.enabled && self.app.stats.port == 0 {
            return Err(ConfigError::invalid("app.stats.port must be set when stats are enabled"));
        }

        self.worker.retry.to_policy()?;

        if self.worker.backend == Backend::Redis {
            let redis = self.worker.redis.as_ref().ok_or(ConfigError::MissingRedis)?;
            if redis.url.trim().is_empty() {
                return Err(ConfigError::invalid("worker.redis.url must not be empty"));
            }
        }

        for (name, job) in &self.worker.jobs {
            job.to_spec(name)?;
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> ValidationResult<RetryPolicy> {
        self.worker.retry.to_policy()
    }

    /// Job specs in name order.
    pub fn job_specs(&self) -> ValidationResult<Vec<JobSpec>> {
        self.worker
            .jobs
            .iter()
            .map(|(name, job)| job.to_spec(name))
            .collect()
    }
}

/// Read and validate the configuration at `path`.
pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Config::from_yaml_str(&raw)
}

/// Load from `JOBFORGE_CONFIG`, or the default path when unset.
pub fn load_from_env() -> Result<Config, ConfigError> {
    load(resolve_path(std::env::var_os(CONFIG_ENV)))
}

fn resolve_path(var: Option<OsString>) -> PathBuf {
    match var {
        Some(p) if !p.is_empty() => PathBuf::from(p),
        _ => PathBuf::from(DEFAULT_PATH),
    }
}

fn default_stack() -> String {
    "jobforge".to_string()
}

fn default_verbose() -> u8 {
    2
}

fn default_stats_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_pool() -> usize {
    10
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}
