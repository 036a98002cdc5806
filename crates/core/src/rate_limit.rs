//! Token-bucket rate limiting for provider submissions.
//!
//! The bucket is pure state-machine logic: callers report elapsed wall
//! time and the bucket refills accordingly. The worker pool wraps one
//! bucket in a mutex and feeds it `Instant` deltas, keeping submissions
//! under the provider quota independently of worker concurrency.

use std::time::Duration;

/// A token bucket with fractional refill.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
}

impl TokenBucket {
    /// Create a bucket holding at most `capacity` tokens, refilled at
    /// `refill_per_sec` tokens per second. Starts full.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: refill_per_sec.max(0.0),
        }
    }

    /// Bucket sized for `n` operations per minute with burst capacity `n`.
    pub fn per_minute(n: u32) -> Self {
        Self::new(n, f64::from(n.max(1)) / 60.0)
    }

    /// Refill for `elapsed` wall time, then try to take one token.
    ///
    /// Returns `true` when a token was consumed.
    pub fn try_acquire(&mut self, elapsed: Duration) -> bool {
        self.refill(elapsed);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token becomes available, assuming no refill
    /// has happened since the last `try_acquire`.
    pub fn time_until_available(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.refill_per_sec <= 0.0 {
            // Never refills; callers treat this as "wait forever".
            return Duration::MAX;
        }
        let deficit = 1.0 - self.tokens;
        Duration::from_secs_f64(deficit / self.refill_per_sec)
    }

    fn refill(&mut self, elapsed: Duration) {
        let added = elapsed.as_secs_f64() * self.refill_per_sec;
        self.tokens = (self.tokens + added).min(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_allows_burst_up_to_capacity() {
        let mut bucket = TokenBucket::new(3, 1.0);
        assert!(bucket.try_acquire(Duration::ZERO));
        assert!(bucket.try_acquire(Duration::ZERO));
        assert!(bucket.try_acquire(Duration::ZERO));
        assert!(!bucket.try_acquire(Duration::ZERO));
    }

    #[test]
    fn refills_over_elapsed_time() {
        let mut bucket = TokenBucket::new(1, 2.0);
        assert!(bucket.try_acquire(Duration::ZERO));
        assert!(!bucket.try_acquire(Duration::ZERO));
        // 2 tokens/sec: half a second refills the single slot.
        assert!(bucket.try_acquire(Duration::from_millis(500)));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(2, 10.0);
        // A long idle period must still cap the burst at 2.
        assert!(bucket.try_acquire(Duration::from_secs(60)));
        assert!(bucket.try_acquire(Duration::ZERO));
        assert!(!bucket.try_acquire(Duration::ZERO));
    }

    #[test]
    fn time_until_available_reports_deficit() {
        let mut bucket = TokenBucket::new(1, 1.0);
        assert_eq!(bucket.time_until_available(), Duration::ZERO);
        assert!(bucket.try_acquire(Duration::ZERO));
        let wait = bucket.time_until_available();
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_secs(1));
    }

    #[test]
    fn per_minute_bucket_matches_quota() {
        let mut bucket = TokenBucket::per_minute(10);
        for _ in 0..10 {
            assert!(bucket.try_acquire(Duration::ZERO));
        }
        assert!(!bucket.try_acquire(Duration::ZERO));
        // One more token after six seconds at 10/min.
        assert!(bucket.try_acquire(Duration::from_secs(6)));
    }
}
