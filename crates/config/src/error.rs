use std::path::PathBuf;

use thiserror::Error;

use jobforge_core::ValidationError;

/// Any of these aborts startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("invalid config: {0}")]
    InvalidValue(String),

    #[error("worker.backend is `redis` but no worker.redis block is configured")]
    MissingRedis,

    #[error("no job named `{0}` is known to this worker")]
    UnknownJob(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }
}
