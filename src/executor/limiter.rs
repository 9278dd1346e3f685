//! Token-bucket rate limiting for outbound requests.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket: `rate` tokens per second, burst up to `rate`.
pub struct RateLimiter {
    rate: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        let rate = f64::from(requests_per_second.max(1));
        Self {
            rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.rate);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_rate_is_immediate() {
        let limiter = RateLimiter::new(100);
        let start = Instant::now();
        for _ in 0..50 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn sustained_rate_is_bounded() {
        let limiter = RateLimiter::new(50);
        // Drain the burst allowance first.
        for _ in 0..50 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        // 10 tokens at 50/s needs roughly 200ms.
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
