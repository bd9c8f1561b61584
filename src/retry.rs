//! Retry policy and backoff bookkeeping shared by both connection managers.
//!
//! Delays grow exponentially from `base_delay` by `multiplier` per attempt and
//! are capped at `max_delay`. A [`Backoff`] is the attempt counter owned by a
//! single retry loop.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Attempts allowed before giving up, counting the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    /// 5 attempts, starting at 500ms, doubling, capped at 30s.
    fn default() -> Self {
        RetryPolicy {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        max_attempts: u32,
    ) -> RetryPolicy {
        RetryPolicy {
            base_delay,
            multiplier,
            max_delay,
            max_attempts,
        }
    }

    /// Whether another attempt may follow `attempts` failed ones.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay to wait after the failure of zero-indexed `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Backoff {
        Backoff {
            policy,
            attempts: 0,
        }
    }

    /// Record a failed attempt and return how long to wait before the next
    /// one, or `None` when the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        match self.policy.should_retry(self.attempts) {
            true => Some(delay),
            false => None,
        }
    }

    /// Delay used once the budget is spent and a component keeps reconnecting
    /// in the background.
    pub fn capped_delay(&self) -> Duration {
        self.policy.max_delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        !self.policy.should_retry(self.attempts)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), 2.0, Duration::from_millis(1000), 4)
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
        assert_eq!(p.delay_for(4), Duration::from_millis(1000));
        assert_eq!(p.delay_for(400), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_budget() {
        let mut backoff = policy().backoff();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert!(!backoff.exhausted());
        assert_eq!(backoff.next_delay(), None);
        assert!(backoff.exhausted());
        assert_eq!(backoff.attempts(), 4);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let mut backoff = RetryPolicy::new(Duration::ZERO, 2.0, Duration::ZERO, 1).backoff();
        assert_eq!(backoff.next_delay(), None);
    }
}
