//! Static description of a schedulable job.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

/// One schedulable job, built from configuration at startup and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique across all registered jobs; doubles as the queue name.
    pub queue_name: String,
    /// Max parallel executions of the handler.
    pub concurrency: usize,
    /// Interval between enqueue ticks. Zero means "tick repeatedly".
    pub period: Duration,
    /// Whether the tick loop runs at all.
    pub enabled: bool,
    /// Job-specific parameters, opaque to the scheduler.
    pub metadata: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn new(
        queue_name: impl Into<String>,
        concurrency: usize,
        period: Duration,
        enabled: bool,
    ) -> ValidationResult<Self> {
        let spec = Self {
            queue_name: queue_name.into(),
            concurrency,
            period,
            enabled,
            metadata: BTreeMap::new(),
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> ValidationResult<()> {
        if self.queue_name.trim().is_empty() {
            return Err(ValidationError::EmptyQueueName);
        }
        if self.concurrency == 0 {
            return Err(ValidationError::ZeroConcurrency {
                queue: self.queue_name.clone(),
            });
        }
        Ok(())
    }

    /// Look up a metadata key the handler cannot work without.
    ///
    /// Blank values count as missing: a silent default would hide a broken
    /// configuration.
    pub fn required_metadata(&self, key: &str) -> ValidationResult<&str> {
        match self.metadata.get(key).map(|v| v.trim()) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(ValidationError::missing_metadata(&self.queue_name, key)),
        }
    }

    pub fn optional_metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}
