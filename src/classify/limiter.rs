// src/classify/limiter.rs
//! Token bucket for the classification service request rate.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// `capacity` tokens of burst, refilled at `per_minute` tokens a minute.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    per_sec: f64,
    state: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(capacity: u32, per_minute: u32) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            per_sec: f64::from(per_minute.max(1)) / 60.0,
            state: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, b: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(b.last_refill).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.per_sec).min(self.capacity);
        b.last_refill = now;
    }

    /// Take a token if one is available now.
    pub fn try_acquire(&self) -> bool {
        let mut b = self.state.lock();
        self.refill(&mut b, Instant::now());
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut b = self.state.lock();
                self.refill(&mut b, Instant::now());
                if b.tokens >= 1.0 {
                    b.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - b.tokens) / self.per_sec)
            };
            tracing::trace!(target: "classify", wait_ms = wait.as_millis() as u64, "rate limit wait");
            tokio::time::sleep(wait).await;
        }
    }

    pub fn available(&self) -> f64 {
        let mut b = self.state.lock();
        self.refill(&mut b, Instant::now());
        b.tokens
    }
}
