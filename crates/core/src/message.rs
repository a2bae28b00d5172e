//! Message envelope delivered to queue handlers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::id::MessageId;
use crate::retry::RetryPolicy;

/// An opaque payload plus the delivery metadata the queue needs.
///
/// The payload bytes are never interpreted by the queue; they reach the
/// handler exactly as they were enqueued. Periodic triggers use an empty
/// payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub queue: String,
    pub payload: Vec<u8>,
    pub retry_policy: RetryPolicy,
    /// Failed deliveries so far (0 on first delivery).
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Error reported by the most recent failed delivery.
    pub last_error: Option<String>,
}

impl Message {
    pub fn new(queue: impl Into<String>, payload: Vec<u8>, retry_policy: RetryPolicy) -> Self {
        Self {
            id: MessageId::new(),
            queue: queue.into(),
            payload,
            retry_policy,
            attempt: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    /// Build a message whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(
        queue: impl Into<String>,
        value: &T,
        retry_policy: RetryPolicy,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(queue, serde_json::to_vec(value)?, retry_policy))
    }

    /// Decode a JSON payload into a job-specific type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// A trigger carries no data; the delivery itself is the signal.
    pub fn is_trigger(&self) -> bool {
        self.payload.is_empty()
    }

    /// Record a failed delivery.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempt = self.attempt.saturating_add(1);
        self.last_error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Args {
        url: String,
        limit: u32,
    }

    #[test]
    fn json_payload_decodes_back() {
        let args = Args {
            url: "https://example.test".to_string(),
            limit: 3,
        };
        let msg = Message::json("fetch", &args, RetryPolicy::default()).unwrap();

        assert!(!msg.is_trigger());
        assert_eq!(msg.decode::<Args>().unwrap(), args);
    }

    #[test]
    fn trigger_has_empty_payload() {
        let msg = Message::new("tick", Vec::new(), RetryPolicy::disabled());
        assert!(msg.is_trigger());
        assert_eq!(msg.attempt, 0);
        assert!(msg.last_error.is_none());
    }

    #[test]
    fn record_failure_bumps_attempt() {
        let mut msg = Message::new("tick", Vec::new(), RetryPolicy::default());
        msg.record_failure("boom");
        msg.record_failure("boom again");

        assert_eq!(msg.attempt, 2);
        assert_eq!(msg.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn wire_encoding_keeps_payload_bytes() {
        let payload = vec![0u8, 159, 146, 150, 255];
        let msg = Message::new("bytes", payload.clone(), RetryPolicy::default());

        let wire = serde_json::to_vec(&msg).unwrap();
        let back: Message = serde_json::from_slice(&wire).unwrap();
        assert_eq!(back.payload, payload);
        assert_eq!(back.id, msg.id);
    }
}
