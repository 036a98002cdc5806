//! Exponential-backoff retry policy for queue redelivery.
//!
//! A nacked queue entry becomes runnable again after
//! `base * 2^(attempt - 1)`, clamped to `cap`. The resulting delay
//! sequence for the defaults is 5 s, 10 s, 20 s, 40 s, ... up to 5 min.

use std::time::Duration;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay applied after the first failed attempt.
    pub base: Duration,
    /// Upper bound on the delay between attempts.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay to apply after the given 1-based failed attempt number.
    ///
    /// Attempt 1 waits `base`, attempt 2 waits `2 * base`, and so on,
    /// clamped to `cap`. An attempt number of 0 is treated as 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = 1u64 << exponent;
        let delay_ms = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay_ms).min(self.cap)
    }
}
