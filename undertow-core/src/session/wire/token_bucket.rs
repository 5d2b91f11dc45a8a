//! Process-wide bandwidth limits for the wire engine.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Classic token bucket: refills at `refill_rate` tokens per second up to
/// `capacity`, one token per byte.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u64,
    tokens: u64,
    refill_rate: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket holding one second of burst at `rate` bytes per second.
    /// A zero rate is clamped to one byte per second.
    pub fn per_second(rate: u64) -> Self {
        let rate = rate.max(1);
        Self {
            capacity: rate,
            tokens: rate,
            refill_rate: rate,
            last_refill: Instant::now(),
        }
    }

    /// Consumes up to `requested` tokens and returns how many were taken.
    pub fn consume(&mut self, requested: u64) -> u64 {
        self.refill();
        let consumed = requested.min(self.tokens);
        self.tokens -= consumed;
        consumed
    }

    pub fn available_tokens(&mut self) -> u64 {
        self.refill();
        self.tokens
    }

    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }

    /// Time until `tokens` more tokens will have accrued.
    pub fn wait_time(&self, tokens: u64) -> Duration {
        Duration::from_secs_f64(tokens as f64 / self.refill_rate as f64)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        if elapsed >= Duration::from_millis(1) {
            let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;
            if tokens_to_add > 0 {
                self.tokens = (self.tokens + tokens_to_add).min(self.capacity);
                self.last_refill = now;
            }
        }
    }
}

/// Shared limiter; `None` means unlimited. The bucket is swapped whole on
/// reconfigure so a new rate applies to the next acquisition.
#[derive(Debug, Default)]
pub struct RateLimiter {
    bucket: Mutex<Option<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(rate: Option<u64>) -> Self {
        Self {
            bucket: Mutex::new(rate.map(TokenBucket::per_second)),
        }
    }

    pub fn set_rate(&self, rate: Option<u64>) {
        let mut bucket = self.bucket.lock();
        let current = bucket.as_ref().map(TokenBucket::refill_rate);
        if current != rate {
            *bucket = rate.map(TokenBucket::per_second);
        }
    }

    pub fn rate(&self) -> Option<u64> {
        self.bucket.lock().as_ref().map(TokenBucket::refill_rate)
    }

    /// Waits until `bytes` tokens have been granted.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let wait = {
                let mut guard = self.bucket.lock();
                let Some(bucket) = guard.as_mut() else {
                    return;
                };
                remaining -= bucket.consume(remaining);
                bucket.wait_time(remaining.min(bucket.refill_rate()))
            };
            if remaining > 0 {
                tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_is_capped_by_available() {
        let mut bucket = TokenBucket::per_second(100);
        assert_eq!(bucket.consume(30), 30);
        assert_eq!(bucket.consume(90), 70);
        assert_eq!(bucket.available_tokens(), 0);
    }

    #[test]
    fn test_refill_does_not_exceed_capacity() {
        let mut bucket = TokenBucket::per_second(50);
        std::thread::sleep(Duration::from_millis(20));
        assert!(bucket.available_tokens() <= 50);
    }

    #[tokio::test]
    async fn test_unlimited_limiter_never_waits() {
        let limiter = RateLimiter::new(None);
        tokio::time::timeout(Duration::from_millis(50), limiter.acquire(u64::MAX / 2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_limiter_throttles_and_swaps_rate() {
        let limiter = RateLimiter::new(Some(1000));
        limiter.acquire(1000).await;
        let started = Instant::now();
        limiter.acquire(100).await;
        assert!(started.elapsed() >= Duration::from_millis(50));

        limiter.set_rate(None);
        assert_eq!(limiter.rate(), None);
        tokio::time::timeout(Duration::from_millis(50), limiter.acquire(1 << 30))
            .await
            .unwrap();
    }
}
