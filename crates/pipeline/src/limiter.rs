//! Shared submission rate limiter.
//!
//! Wraps the pure [`TokenBucket`] with wall-clock tracking so all
//! workers draw from one provider quota, independent of concurrency.

use std::time::{Duration, Instant};

use coursecast_core::rate_limit::TokenBucket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Longest single sleep while waiting for a token; keeps the wait loop
/// responsive to cancellation even with a far-off refill.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(1);

/// Shortest sleep, to avoid busy-spinning on sub-millisecond deficits.
const MIN_WAIT_SLICE: Duration = Duration::from_millis(5);

/// Async facade over a shared token bucket.
pub struct SubmitLimiter {
    state: Mutex<LimiterState>,
}

struct LimiterState {
    bucket: TokenBucket,
    last_refill: Instant,
}

impl SubmitLimiter {
    /// Limiter allowing `n` submissions per minute with burst `n`.
    pub fn per_minute(n: u32) -> Self {
        Self::new(TokenBucket::per_minute(n))
    }

    /// Limiter over an arbitrary bucket.
    pub fn new(bucket: TokenBucket) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                bucket,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a submission token is available.
    ///
    /// Returns `false` if the cancellation token fired first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill);
                state.last_refill = now;
                if state.bucket.try_acquire(elapsed) {
                    return true;
                }
                state.bucket.time_until_available()
            };

            let wait = wait.clamp(MIN_WAIT_SLICE, MAX_WAIT_SLICE);
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_within_burst_capacity() {
        let limiter = SubmitLimiter::per_minute(3);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            assert!(limiter.acquire(&cancel).await);
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let limiter = SubmitLimiter::new(TokenBucket::new(1, 0.001));
        let cancel = CancellationToken::new();
        assert!(limiter.acquire(&cancel).await);

        // The bucket is empty and refills far too slowly; only
        // cancellation can end the second acquire.
        cancel.cancel();
        assert!(!limiter.acquire(&cancel).await);
    }

    #[tokio::test]
    async fn waits_for_refill_when_empty() {
        // 20 tokens/sec: an empty bucket refills within ~50ms.
        let limiter = SubmitLimiter::new(TokenBucket::new(1, 20.0));
        let cancel = CancellationToken::new();
        assert!(limiter.acquire(&cancel).await);

        let start = Instant::now();
        assert!(limiter.acquire(&cancel).await);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
