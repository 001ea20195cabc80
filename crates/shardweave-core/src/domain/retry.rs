//! Retry policy: decides backoff delays between scheduler rounds.

use std::time::Duration;

/// Exponential backoff for task rounds in the managed scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Rounds allowed per task, the first one included.
    pub max_attempts: u32,

    /// Delay before the second round.
    pub base_delay: Duration,

    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    /// Delay after `attempts` failed rounds: base_delay * multiplier^(attempts - 1).
    ///
    /// Example with base_delay=200ms, multiplier=2.0:
    /// - after round 1: 200ms
    /// - after round 2: 400ms
    /// - after round 3: 800ms
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2), 2.0);

        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn zero_attempts_uses_base_delay() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2), 2.0);
        assert_eq!(policy.next_delay(0), Duration::from_secs(2));
    }
}
