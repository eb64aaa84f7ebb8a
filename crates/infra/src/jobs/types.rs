//! Queue policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for provisioning jobs.
///
/// Backoff is exponential: attempt `n` (1-indexed) waits
/// `base_delay * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before the next run after attempt `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        1u32.checked_shl(attempt - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Queue-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobQueueConfig {
    pub retry: RetryPolicy,
    /// How long a claim stays exclusive before the reaper may release it.
    pub lock_duration: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lock_duration: Duration::from_secs(5 * 60),
        }
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed this attempt, back to `pending` after a backoff.
    Retrying,
    /// Failed with attempts exhausted; the install was failed too.
    Failed,
    /// The step returned but the claim had already been released by the reaper.
    LockLost,
}

/// Result of one reaper sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub requeued: usize,
    pub failed: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy =
            RetryPolicy::new(10, Duration::from_secs(1)).with_max_delay(Duration::from_secs(5));

        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(5));
    }

    #[test]
    fn exhaustion_respects_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    proptest! {
        #[test]
        fn backoff_never_shrinks(base_ms in 1u64..10_000, attempt in 1u32..80) {
            let policy = RetryPolicy::new(100, Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_secs(24 * 60 * 60));
            let this = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(next >= this);
            prop_assert!(next <= policy.max_delay);
        }
    }
}
