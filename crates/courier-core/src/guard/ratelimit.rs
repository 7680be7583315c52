//! Token-bucket rate limiter.
//!
//! One limiter instance guards each protected resource. The consumer's
//! webhook path waits for a token (bounded by the caller's deadline); the
//! HTTP ingress uses the non-blocking `try_acquire` and answers 429 when
//! the bucket is empty.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

/// Token bucket allowing `rate` acquisitions per second with a burst
/// capacity of `burst`.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a limiter with the given refill rate (per second) and burst
    /// capacity. The bucket starts full.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst).max(1.0);
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket { tokens: burst, last_refill: Instant::now() }),
        }
    }

    /// Takes a token without waiting; `false` when the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Waits until a token is available.
    ///
    /// The wait itself is unbounded; callers enforce their own deadline
    /// (the webhook client wraps this in its request timeout).
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.lock();
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_available_immediately() {
        let limiter = RateLimiter::new(1.0, 5);

        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn tokens_do_not_exceed_burst() {
        let limiter = RateLimiter::new(1000.0, 3);
        std::thread::sleep(Duration::from_millis(50));

        // Plenty of refill time, but the cap still holds.
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn empty_bucket_refills_over_time() {
        let limiter = RateLimiter::new(100.0, 1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        std::thread::sleep(Duration::from_millis(25));
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn acquire_waits_for_a_token() {
        let limiter = RateLimiter::new(50.0, 1);
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;

        // Refill at 50/s means roughly 20ms for the next token.
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn acquire_can_be_bounded_by_caller_deadline() {
        let limiter = RateLimiter::new(0.1, 1);
        limiter.acquire().await;

        let bounded = tokio::time::timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(bounded.is_err());
    }
}
