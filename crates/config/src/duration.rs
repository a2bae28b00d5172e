//! Humantime-formatted durations (`30s`, `1m 30s`, `250ms`).

use std::time::Duration;

use serde::{Deserialize, Deserializer};

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim())
        .map_err(|e| serde::de::Error::custom(format!("invalid duration `{}`: {}", raw, e)))
}
