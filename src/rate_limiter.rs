//! Request rate limiting using a token bucket
//!
//! The RequestLimiter caps how many batch-get requests are issued per second
//! across every batch in flight, so a concurrent fetch never exceeds the issue
//! rate the backend's throughput ceiling allows.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Request limiter shared by all in-flight batches of a fetch
///
/// # Algorithm
///
/// - Tokens represent requests that may be issued
/// - Tokens refill at a constant rate (`limit_rps`), up to one second's worth
/// - Each backend call acquires one token before it is issued
/// - If no token is available, the caller waits for the refill
///
/// Token tracking is lock-free (`AtomicU64`), so clones of the limiter can be
/// used from several futures at once.
#[derive(Clone)]
pub struct RequestLimiter {
    /// Requests per second (0 = unlimited)
    limit_rps: u64,
    /// Available tokens
    tokens: Arc<AtomicU64>,
    /// Last refill timestamp (nanoseconds since arbitrary epoch)
    last_refill: Arc<AtomicU64>,
}

impl RequestLimiter {
    /// Create a limiter allowing `limit_rps` requests per second (None = unlimited)
    ///
    /// # Examples
    ///
    /// ```
    /// use keyset_export::rate_limiter::RequestLimiter;
    ///
    /// let limiter = RequestLimiter::new(Some(10));
    /// assert_eq!(limiter.limit(), Some(10));
    ///
    /// let unlimited = RequestLimiter::new(None);
    /// assert_eq!(unlimited.limit(), None);
    /// ```
    #[must_use]
    pub fn new(limit_rps: Option<u64>) -> Self {
        let limit = limit_rps.unwrap_or(0);
        Self {
            limit_rps: limit,
            tokens: Arc::new(AtomicU64::new(limit)),
            last_refill: Arc::new(AtomicU64::new(Self::now_nanos())),
        }
    }

    /// The configured cap, None if unlimited
    pub fn limit(&self) -> Option<u64> {
        if self.limit_rps == 0 {
            None
        } else {
            Some(self.limit_rps)
        }
    }

    /// Wait until `requests` tokens have been acquired
    ///
    /// Returns immediately when unlimited or when `requests` is zero.
    pub async fn acquire(&self, requests: u64) {
        if requests == 0 || self.limit_rps == 0 {
            return;
        }

        let mut remaining = requests;

        loop {
            self.refill_tokens();

            let current_tokens = self.tokens.load(Ordering::SeqCst);
            let to_consume = remaining.min(current_tokens);

            if to_consume > 0 {
                if self
                    .tokens
                    .compare_exchange(
                        current_tokens,
                        current_tokens - to_consume,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    remaining -= to_consume;
                    if remaining == 0 {
                        return;
                    }
                }
                continue;
            }

            // Wait roughly one token interval, re-checking at least every 100ms
            let wait_ms = 1000 / self.limit_rps;
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(1, 100))).await;
        }
    }

    fn refill_tokens(&self) {
        let now = Self::now_nanos();
        let last = self.last_refill.load(Ordering::SeqCst);

        let elapsed_secs = now.saturating_sub(last) as f64 / 1_000_000_000.0;
        let tokens_to_add = (self.limit_rps as f64 * elapsed_secs) as u64;

        if tokens_to_add > 0
            && self
                .last_refill
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            // Cap at one second's worth of requests (bucket capacity)
            let current_tokens = self.tokens.load(Ordering::SeqCst);
            let new_tokens = (current_tokens + tokens_to_add).min(self.limit_rps);
            self.tokens.store(new_tokens, Ordering::SeqCst);
        }
    }

    /// Monotonic time in nanoseconds since an arbitrary process-wide epoch
    fn now_nanos() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

impl std::fmt::Debug for RequestLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLimiter")
            .field("limit_rps", &self.limit_rps)
            .field("tokens", &self.tokens.load(Ordering::Relaxed))
            .finish()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_with_limit_starts_with_full_bucket() {
        let limiter = RequestLimiter::new(Some(20));
        assert_eq!(limiter.limit(), Some(20));
        assert_eq!(limiter.tokens.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn new_none_is_unlimited() {
        let limiter = RequestLimiter::new(None);
        assert_eq!(limiter.limit(), None);
        assert_eq!(limiter.tokens.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn unlimited_acquire_returns_immediately() {
        let limiter = RequestLimiter::new(None);
        let start = Instant::now();
        limiter.acquire(10_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn acquire_consumes_tokens() {
        let limiter = RequestLimiter::new(Some(50));
        for _ in 0..10 {
            limiter.acquire(1).await;
        }
        let remaining = limiter.tokens.load(Ordering::Relaxed);
        assert!(
            (40..=41).contains(&remaining),
            "expected ~40 tokens remaining, got {remaining}"
        );
    }

    #[tokio::test]
    async fn empty_bucket_waits_for_refill() {
        let limiter = RequestLimiter::new(Some(20)); // one token every 50ms
        limiter.tokens.store(0, Ordering::SeqCst);
        limiter
            .last_refill
            .store(RequestLimiter::now_nanos(), Ordering::SeqCst);

        let start = Instant::now();
        limiter.acquire(2).await;
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(80),
            "two tokens at 20/s should take ~100ms, took {elapsed:?}"
        );
        assert!(
            elapsed < Duration::from_secs(2),
            "should not wait excessively, took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn clones_share_one_bucket() {
        let limiter = RequestLimiter::new(Some(10));
        let clone = limiter.clone();
        clone.acquire(4).await;
        let remaining = limiter.tokens.load(Ordering::Relaxed);
        assert!(remaining <= 7, "clone should draw from the same bucket");
    }
}
