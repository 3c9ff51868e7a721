//! Token-bucket throttle shared by every scanner in a job.
//!
//! The bucket refills continuously at `rate` permits per second up to
//! `burst`. Tokens are deducted only when a permit is granted, so a caller
//! cancelled while waiting takes nothing with it. A granted [`Permit`] that
//! is dropped without [`Permit::spend`] puts its tokens back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::scanner::ScanError;

const EPSILON: f64 = 1e-9;

/// Shortest sleep between refill checks; below the timer resolution a
/// shorter sleep would spin.
const MIN_WAIT: Duration = Duration::from_millis(1);

pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
    granted: AtomicU64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate: f64, burst: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }
}

impl RateLimiter {
    /// A full bucket. `rate` and `burst` are clamped to at least 1.
    pub fn new(rate_pps: u32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: f64::from(rate_pps.max(1)),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            granted: AtomicU64::new(0),
        }
    }

    /// Wait until `n` permits are available, or fail with
    /// [`ScanError::RateLimitTimeout`] as soon as it is clear that waiting
    /// would run past `deadline`. Requests above `burst` are clamped.
    pub async fn acquire(&self, n: u32, deadline: Instant) -> Result<Permit<'_>, ScanError> {
        let n = f64::from(n.max(1)).min(self.burst);

        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                bucket.refill(Instant::now(), self.rate, self.burst);
                if bucket.tokens + EPSILON >= n {
                    bucket.tokens = (bucket.tokens - n).max(0.0);
                    self.granted.fetch_add(n as u64, Ordering::Relaxed);
                    return Ok(Permit {
                        limiter: self,
                        tokens: n,
                        spent: false,
                    });
                }
                Duration::from_secs_f64((n - bucket.tokens) / self.rate).max(MIN_WAIT)
            };

            let wake = Instant::now() + wait;
            if wake > deadline {
                return Err(ScanError::RateLimitTimeout);
            }
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Net permits granted so far (refunds subtracted).
    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    fn refund(&self, tokens: f64) {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now(), self.rate, self.burst);
        bucket.tokens = (bucket.tokens + tokens).min(self.burst);
        self.granted.fetch_sub(tokens as u64, Ordering::Relaxed);
    }
}

/// Permission to send. Call [`Permit::spend`] once the packet is out.
#[must_use = "dropping a permit without spending it refunds the tokens"]
pub struct Permit<'a> {
    limiter: &'a RateLimiter,
    tokens: f64,
    spent: bool,
}

impl Permit<'_> {
    pub fn spend(mut self) {
        self.spent = true;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.spent {
            self.limiter.refund(self.tokens);
        }
    }
}
