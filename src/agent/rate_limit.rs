//! Per-provider token bucket.
//!
//! One bucket per provider, shared by every session and every workflow
//! instance, so the provider's request ceiling holds process-wide.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::{EngineError, EngineResult};

/// Token bucket limiter. A bucket built with a zero rate never blocks.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket allowing `requests_per_minute` with bursts of `burst`.
    pub fn per_minute(requests_per_minute: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            refill_per_sec: f64::from(requests_per_minute) / 60.0,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
        }
    }

    /// Bucket that never limits.
    pub fn unlimited() -> Self {
        Self::per_minute(0, 1)
    }

    /// Whether this bucket limits at all.
    pub fn is_limited(&self) -> bool {
        self.refill_per_sec > 0.0
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.reserve().is_none()
    }

    /// Wait for a token, aborting if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> EngineResult<()> {
        loop {
            let Some(wait) = self.reserve() else {
                return Ok(());
            };
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limiter waiting");
            tokio::select! {
                () = cancel.cancelled() => return Err(EngineError::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Consume a token, or report how long until one is available.
    fn reserve(&self) -> Option<Duration> {
        if !self.is_limited() {
            return None;
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - state.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_blocks() {
        let bucket = TokenBucket::unlimited();
        assert!(!bucket.is_limited());
        for _ in 0..1000 {
            assert!(bucket.try_acquire());
        }
    }

    #[test]
    fn test_burst_then_empty() {
        let bucket = TokenBucket::per_minute(60, 3);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        // 1200 rpm = one token every 50ms.
        let bucket = TokenBucket::per_minute(1200, 1);
        let token = CancellationToken::new();

        bucket.acquire(&token).await.unwrap();
        let start = Instant::now();
        bucket.acquire(&token).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_acquire_is_cancellable() {
        let bucket = TokenBucket::per_minute(1, 1);
        let token = CancellationToken::new();
        bucket.acquire(&token).await.unwrap();

        token.cancel();
        let err = bucket.acquire(&token).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
