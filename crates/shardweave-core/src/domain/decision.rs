//! Decision model: what the managed scheduler does after a failed round.

use std::time::Duration;

use super::attempt::AttemptLog;
use super::retry::RetryPolicy;

/// The next action for a task whose candidates were all exhausted.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Run another round over the candidates after a delay.
    Retry { delay: Duration, reason: String },

    /// Report the task as failed.
    GiveUp { reason: String },
}

/// Pure function from (rounds so far, failures) to the next action.
pub trait Decider: Send + Sync {
    fn decide(&self, rounds: u32, log: &AttemptLog) -> Decision;
}

/// Retries only while every failure was transient and rounds remain.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, rounds: u32, log: &AttemptLog) -> Decision {
        if !log.all_transient() {
            return Decision::GiveUp {
                reason: "non-transient failure on a candidate".to_string(),
            };
        }
        if rounds >= self.retry_policy.max_attempts {
            return Decision::GiveUp {
                reason: format!(
                    "max rounds reached: {}/{}",
                    rounds, self.retry_policy.max_attempts
                ),
            };
        }
        let delay = self.retry_policy.next_delay(rounds);
        Decision::Retry {
            delay,
            reason: format!(
                "round {}/{} after {:?}",
                rounds + 1,
                self.retry_policy.max_attempts,
                delay
            ),
        }
    }
}
