// Backoff policy for tasks rejected again on a drain pass
//
// Implements retry strategy with:
// - Fixed or exponential backoff (1s, 2s, 4s, 8s, ...)
// - Delay cap
// - Maximum attempt count, after which the task is dead-lettered
// - Jitter to keep retried identities from waking in lockstep

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay every time
    Fixed,
    /// Delay doubles with each attempt
    Exponential,
}

/// Retry policy configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first re-evaluation, in milliseconds (default 1000ms).
    /// Also the delay the request path uses when it queues a task.
    pub initial_delay_ms: u64,
    /// Backoff growth (default exponential)
    pub backoff: Backoff,
    /// Maximum delay in milliseconds (default 30000ms)
    pub max_delay_ms: u64,
    /// Rejected admissions after which the task is dead-lettered; 0 retries forever
    pub max_attempts: u32,
    /// Jitter as a fraction of the delay, 0.0 to 1.0 (default 0.1)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            backoff: Backoff::Exponential,
            max_delay_ms: 30_000,
            max_attempts: 10,
            jitter: 0.1,
        }
    }
}

/// Retry decision for a rejected attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry after this delay
    Retry(Duration),
    /// Give up and move to the dead letter queue
    GiveUp,
}

impl RetryPolicy {
    /// Fixed 1s delay, never gives up
    pub fn unbounded_fixed() -> Self {
        Self {
            backoff: Backoff::Fixed,
            max_attempts: 0,
            jitter: 0.0,
            ..Self::default()
        }
    }

    /// Delay used by the request path when a submission is rejected
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Delay before re-evaluating a task on its `attempt`-th rejection
    /// (1-indexed), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let delay_ms = match self.backoff {
            Backoff::Fixed => self.initial_delay_ms,
            Backoff::Exponential => {
                let exponent = attempt.saturating_sub(1).min(63);
                self.initial_delay_ms
                    .saturating_mul(2_u64.saturating_pow(exponent))
            }
        };
        Duration::from_millis(delay_ms.min(self.max_delay_ms.max(self.initial_delay_ms)))
    }

    /// Decide what to do after the `attempt`-th rejected admission
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if self.max_attempts > 0 && attempt >= self.max_attempts {
            debug!("Max attempts ({}) exceeded, giving up", self.max_attempts);
            return RetryDecision::GiveUp;
        }

        let delay_ms = self.base_delay(attempt).as_millis() as u64;

        // Add jitter (± jitter fraction of delay)
        let delay_ms = if self.jitter > 0.0 && delay_ms > 0 {
            let jitter = (delay_ms as f64 * self.jitter.min(1.0)) as u64;
            let mut rng = rand::rng();
            let random_jitter = rng.random_range(0..=jitter);

            if rng.random_bool(0.5) {
                delay_ms.saturating_add(random_jitter)
            } else {
                delay_ms.saturating_sub(random_jitter).max(1)
            }
        } else {
            delay_ms
        };

        debug!(
            "Retry attempt {} - delay {} ms (max: {} ms)",
            attempt, delay_ms, self.max_delay_ms
        );

        RetryDecision::Retry(Duration::from_millis(delay_ms))
    }
}
