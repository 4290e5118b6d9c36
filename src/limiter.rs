// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Token-bucket byte budget shared by the streaming tasks of one transfer.
///
/// A rate of 0 disables limiting. Burst capacity equals one second of
/// budget.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

struct Bucket {
    rate: u64,
    tokens: u64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        if self.rate == 0 {
            return;
        }
        let now = Instant::now();
        let earned = (now.duration_since(self.last_refill).as_secs_f64() * self.rate as f64) as u64;
        if earned > 0 {
            self.tokens = (self.tokens + earned).min(self.rate);
            self.last_refill = now;
        }
    }
}

impl RateLimiter {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                rate: rate_bytes_per_sec,
                tokens: rate_bytes_per_sec,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Debits `amount` bytes from the budget, sleeping until enough tokens
    /// have accrued. Returns immediately when limiting is disabled.
    pub async fn acquire(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.rate == 0 {
                    return;
                }
                bucket.refill();
                // Oversized chunks drain whatever is available so they can
                // never stall forever.
                let due = amount.min(bucket.rate);
                if bucket.tokens >= due {
                    bucket.tokens -= due;
                    return;
                }
                Duration::from_secs_f64((due - bucket.tokens) as f64 / bucket.rate as f64)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        let start = StdInstant::now();
        limiter.acquire(50_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn acquire_within_burst_is_immediate() {
        let limiter = RateLimiter::new(1_000_000);
        let start = StdInstant::now();
        limiter.acquire(1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_beyond_budget_sleeps() {
        let limiter = RateLimiter::new(1_000);
        limiter.acquire(1_000).await;
        // Budget exhausted; the next debit must advance virtual time.
        let before = tokio::time::Instant::now();
        limiter.acquire(500).await;
        assert!(tokio::time::Instant::now() - before >= Duration::from_millis(400));
    }
}
