//! Retry policy and backoff arithmetic.
//!
//! A policy is built once per job and handed to the queue with every enqueue.
//! The queue consults it after each failed delivery; nothing here performs IO.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

/// Outcome of consulting a [`RetryPolicy`] after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redeliver after `delay`. `attempt` is the 1-indexed retry number.
    Retry { attempt: u32, delay: Duration },
    /// The retry budget is spent; the message has permanently failed.
    Exhausted { attempts: u32 },
    /// Retries are switched off; the first failure is terminal.
    Disabled,
}

impl RetryDecision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RetryDecision::Retry { .. })
    }
}

/// Exponential backoff with jitter, clamped to `[min_delay, max_delay]`.
///
/// The delay before retry `n` is `clamp(min_delay, max_delay, exponent^n s + jitter)`
/// where jitter is drawn uniformly from `[0, max_jitter]`.
///
/// When `enabled` is false the remaining fields are inert, but they are still
/// carried along so the queue layer can report them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Upper bound on retries (0 = fail on the first error).
    pub max_retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Base of the exponential growth, in seconds per attempt.
    pub exponent: f64,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponent: 2.0,
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Build a validated policy.
    pub fn new(
        enabled: bool,
        max_retries: u32,
        min_delay: Duration,
        max_delay: Duration,
        exponent: f64,
        max_jitter: Duration,
    ) -> ValidationResult<Self> {
        let policy = Self {
            enabled,
            max_retries,
            min_delay,
            max_delay,
            exponent,
            max_jitter,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> ValidationResult<()> {
        if self.min_delay > self.max_delay {
            return Err(ValidationError::InvertedDelayBounds {
                min: self.min_delay,
                max: self.max_delay,
            });
        }
        if !self.exponent.is_finite() || self.exponent < 0.0 {
            return Err(ValidationError::InvalidExponent(self.exponent));
        }
        Ok(())
    }

    /// Delay before retry `attempt` for an explicit jitter value.
    ///
    /// Growth that overflows `Duration` saturates at `max_delay`.
    pub fn backoff(&self, attempt: u32, jitter: Duration) -> Duration {
        let growth = Duration::try_from_secs_f64(self.exponent.powf(f64::from(attempt)))
            .unwrap_or(self.max_delay);

        growth
            .saturating_add(jitter)
            .max(self.min_delay)
            .min(self.max_delay)
    }

    /// Draw a jitter value uniformly from `[0, max_jitter]`.
    pub fn sample_jitter<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(rng.gen_range(0.0..=self.max_jitter.as_secs_f64()))
    }

    /// Whether retry number `attempt` (1-indexed) is allowed at all.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && attempt >= 1 && attempt <= self.max_retries
    }

    /// Delay before retry `attempt`, or `None` when that retry is not allowed.
    pub fn delay_for_retry<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        Some(self.backoff(attempt, self.sample_jitter(rng)))
    }

    /// Decide what happens after the `failures`-th failed delivery of a message.
    pub fn decide<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> RetryDecision {
        if !self.enabled {
            return RetryDecision::Disabled;
        }
        match self.delay_for_retry(failures, rng) {
            Some(delay) => RetryDecision::Retry {
                attempt: failures,
                delay,
            },
            None => RetryDecision::Exhausted {
                attempts: failures,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            max_retries,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponent: 2.0,
            max_jitter: Duration::ZERO,
        }
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = policy(10);

        assert_eq!(policy.backoff(1, Duration::ZERO), Duration::from_secs(2));
        assert_eq!(policy.backoff(2, Duration::ZERO), Duration::from_secs(4));
        assert_eq!(policy.backoff(3, Duration::ZERO), Duration::from_secs(8));
        assert_eq!(policy.backoff(5, Duration::ZERO), Duration::from_secs(32));
    }

    #[test]
    fn backoff_is_clamped_to_bounds() {
        let policy = RetryPolicy {
            min_delay: Duration::from_secs(5),
            ..policy(10)
        };

        // 2^1 = 2s is raised to the floor.
        assert_eq!(policy.backoff(1, Duration::ZERO), Duration::from_secs(5));
        // 2^7 = 128s is capped.
        assert_eq!(policy.backoff(7, Duration::ZERO), Duration::from_secs(60));
    }

    #[test]
    fn jitter_is_added_before_clamping() {
        let policy = policy(10);
        assert_eq!(
            policy.backoff(2, Duration::from_millis(500)),
            Duration::from_millis(4500)
        );
        assert_eq!(
            policy.backoff(5, Duration::from_secs(100)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn huge_growth_saturates_at_max_delay() {
        let policy = RetryPolicy {
            exponent: 1e10,
            ..policy(u32::MAX)
        };
        assert_eq!(policy.backoff(400, Duration::ZERO), Duration::from_secs(60));
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let policy = policy(3);

        assert!(!policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn disabled_policy_never_retries() {
        let mut rng = StdRng::seed_from_u64(7);
        let policy = RetryPolicy {
            enabled: false,
            ..policy(10)
        };

        assert_eq!(policy.decide(1, &mut rng), RetryDecision::Disabled);
        assert!(policy.delay_for_retry(1, &mut rng).is_none());
        // Fields stay visible even though they are inert.
        assert_eq!(policy.max_retries, 10);
    }

    #[test]
    fn exhausted_after_max_retries() {
        let mut rng = StdRng::seed_from_u64(7);
        let policy = policy(2);

        assert!(matches!(
            policy.decide(2, &mut rng),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert_eq!(
            policy.decide(3, &mut rng),
            RetryDecision::Exhausted { attempts: 3 }
        );
        assert!(policy.decide(3, &mut rng).is_terminal());
    }

    #[test]
    fn zero_max_retries_fails_first_time() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            policy(0).decide(1, &mut rng),
            RetryDecision::Exhausted { attempts: 1 }
        );
    }

    #[test]
    fn new_rejects_inverted_bounds() {
        let err = RetryPolicy::new(
            true,
            3,
            Duration::from_secs(10),
            Duration::from_secs(1),
            2.0,
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvertedDelayBounds { .. }));
    }

    #[test]
    fn new_rejects_bad_exponent() {
        for exponent in [f64::NAN, f64::INFINITY, -1.0] {
            let err = RetryPolicy::new(
                true,
                3,
                Duration::ZERO,
                Duration::from_secs(1),
                exponent,
                Duration::ZERO,
            )
            .unwrap_err();
            assert!(matches!(err, ValidationError::InvalidExponent(_)));
        }
    }

    #[test]
    fn policy_survives_serde() {
        let policy = RetryPolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        let back: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Every allowed retry delay lies within the configured bounds.
        #[test]
        fn delay_stays_within_bounds(
            min_ms in 0u64..10_000,
            span_ms in 0u64..120_000,
            exponent in 0.0f64..10.0,
            jitter_ms in 0u64..30_000,
            max_retries in 1u32..40,
            seed in any::<u64>(),
        ) {
            let policy = RetryPolicy::new(
                true,
                max_retries,
                Duration::from_millis(min_ms),
                Duration::from_millis(min_ms + span_ms),
                exponent,
                Duration::from_millis(jitter_ms),
            ).unwrap();
            let mut rng = StdRng::seed_from_u64(seed);

            for n in 1..=max_retries {
                let delay = policy.delay_for_retry(n, &mut rng).unwrap();
                prop_assert!(delay >= policy.min_delay);
                prop_assert!(delay <= policy.max_delay);
            }
            prop_assert!(policy.delay_for_retry(max_retries + 1, &mut rng).is_none());
        }

        /// A disabled policy yields zero retries regardless of its budget.
        #[test]
        fn disabled_means_zero_retries(max_retries in 0u32..1000, n in 0u32..1000) {
            let policy = RetryPolicy { enabled: false, max_retries, ..RetryPolicy::default() };
            let mut rng = StdRng::seed_from_u64(0);
            prop_assert!(policy.decide(n, &mut rng).is_terminal());
        }
    }
}
