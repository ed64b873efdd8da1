// src/retry.rs
//! Retryable operation helper shared by the fetcher and the classification client.
//!
//! A `RetryPolicy` describes the attempt budget and the backoff curve; the caller
//! supplies the operation and a predicate deciding which errors are worth another try.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.5
}

/// Attempt budget + exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Extra random delay as a fraction of the computed delay, in [0, 1].
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (1 = first retry), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(30) as i32;
        let ms = (self.base_delay_ms as f64) * self.multiplier.max(1.0).powi(exp);
        let capped = ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn jittered_delay(&self, retry: u32) -> Duration {
        let base = self.delay_for(retry);
        let frac = self.jitter.clamp(0.0, 1.0);
        if frac == 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::rng().random_range(0.0..=frac);
        base + base.mul_f64(extra)
    }
}

/// Last error plus how many attempts were spent.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryError<E> {
    pub last: E,
    pub attempts: u32,
}

/// Run `op` until it succeeds, the error is not retryable, or attempts run out.
///
/// `op` receives the 1-based attempt number. On success returns the value and
/// the attempt count that produced it.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok((v, attempt)),
            Err(e) => {
                if attempt >= max || !is_retryable(&e) {
                    return Err(RetryError { last: e, attempts: attempt });
                }
                let wait = policy.jittered_delay(attempt);
                tracing::debug!(
                    target: "retry",
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "retrying after transient error"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}
