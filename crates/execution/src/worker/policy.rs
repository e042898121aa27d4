//! Retry policy and the pure settlement decision.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::ErrorKind;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first one included
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt; any transient failure breaks the execution.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before re-dispatching after `attempt` (1-indexed) failed.
    ///
    /// Jitter is derived from `seed` so executions sharing a failure spread out
    /// while each one stays reproducible. The result never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32, seed: u64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let unit = unit_interval(seed ^ u64::from(attempt));
            jitter_range * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }

    /// Whether another attempt may follow `attempts` completed ones.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// splitmix64 mapped onto `[0, 1)`.
fn unit_interval(seed: u64) -> f64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

/// How one attempt of a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Completed,
    Suspended,
    Failed(ErrorKind),
}

/// The status write an attempt settles into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Succeed,
    Suspend,
    Retry { delay: Duration },
    Fail,
    Break,
}

/// Map an attempt outcome to its settlement.
///
/// `attempts` counts the attempt that just ended.
pub fn decide(outcome: OutcomeKind, attempts: u32, policy: &RetryPolicy, seed: u64) -> Settlement {
    match outcome {
        OutcomeKind::Completed => Settlement::Succeed,
        OutcomeKind::Suspended => Settlement::Suspend,
        OutcomeKind::Failed(ErrorKind::Permanent) => Settlement::Fail,
        OutcomeKind::Failed(ErrorKind::Transient) if policy.should_retry(attempts) => {
            Settlement::Retry {
                delay: policy.delay_for_attempt(attempts, seed),
            }
        }
        OutcomeKind::Failed(ErrorKind::Transient) => Settlement::Break,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy,
            jitter: 0.0,
        }
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = no_jitter(BackoffStrategy::Exponential);

        assert_eq!(policy.delay_for_attempt(1, 7), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2, 7), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3, 7), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4, 7), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(20, 7), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        for attempt in 1..=3 {
            assert_eq!(policy.delay_for_attempt(attempt, 1), Duration::from_millis(500));
        }
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = no_jitter(BackoffStrategy::Linear);

        assert_eq!(policy.delay_for_attempt(1, 0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2, 0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3, 0), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn settlement_follows_the_outcome_kind() {
        let policy = RetryPolicy::default();

        assert_eq!(decide(OutcomeKind::Completed, 1, &policy, 0), Settlement::Succeed);
        assert_eq!(decide(OutcomeKind::Suspended, 1, &policy, 0), Settlement::Suspend);
        assert_eq!(
            decide(OutcomeKind::Failed(ErrorKind::Permanent), 1, &policy, 0),
            Settlement::Fail
        );
        assert!(matches!(
            decide(OutcomeKind::Failed(ErrorKind::Transient), 4, &policy, 0),
            Settlement::Retry { .. }
        ));
        assert_eq!(
            decide(OutcomeKind::Failed(ErrorKind::Transient), 5, &policy, 0),
            Settlement::Break
        );
    }

    #[test]
    fn jitter_depends_on_the_seed() {
        let policy = RetryPolicy::default();
        let delays: std::collections::HashSet<_> =
            (0..16).map(|seed| policy.delay_for_attempt(3, seed)).collect();
        assert!(delays.len() > 1);
        assert_eq!(policy.delay_for_attempt(3, 42), policy.delay_for_attempt(3, 42));
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_the_cap(
            attempt in 1u32..200,
            seed in any::<u64>(),
            base_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            jitter in 0.0f64..1.0,
        ) {
            let policy = RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                strategy: BackoffStrategy::Exponential,
                jitter,
            };
            prop_assert!(policy.delay_for_attempt(attempt, seed) <= policy.max_delay);
        }

        #[test]
        fn delay_is_monotonic_without_jitter(attempt in 1u32..100, base_ms in 1u64..5_000) {
            let policy = RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_secs(600),
                strategy: BackoffStrategy::Exponential,
                jitter: 0.0,
            };
            prop_assert!(policy.delay_for_attempt(attempt, 0) <= policy.delay_for_attempt(attempt + 1, 0));
        }

        #[test]
        fn transient_failures_never_retry_past_the_budget(attempts in 0u32..20, max in 0u32..10) {
            let policy = RetryPolicy { max_attempts: max, ..Default::default() };
            let settlement = decide(OutcomeKind::Failed(ErrorKind::Transient), attempts, &policy, 0);
            if attempts >= max {
                prop_assert_eq!(settlement, Settlement::Break);
            } else {
                let is_retry = matches!(settlement, Settlement::Retry { .. });
                prop_assert!(is_retry);
            }
        }
    }
}
