//! Token bucket rate limiter
//!
//! Each limiter gates one traffic direction of one integration. Tokens are
//! refilled lazily from elapsed time whenever a caller asks for admission, so
//! there is no background refill task to manage.

use crate::error::ProxyError;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct Bucket {
    /// May go negative after an admission larger than the capacity
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Token bucket admission gate
///
/// `rate` tokens are added per second up to `capacity`. The bucket starts
/// full, so a burst of up to `capacity` tokens is admitted without delay.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
    stopped: CancellationToken,
}

impl RateLimiter {
    /// Create a limiter whose burst capacity equals its rate (at least one token)
    pub fn new(rate: f64) -> Result<Self, ProxyError> {
        Self::with_burst(rate, rate.max(1.0))
    }

    /// Create a limiter with an explicit burst capacity
    pub fn with_burst(rate: f64, burst: f64) -> Result<Self, ProxyError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ProxyError::validation(
                "rate",
                format!("must be a positive finite number, got {}", rate),
            ));
        }
        if !burst.is_finite() || burst < 1.0 {
            return Err(ProxyError::validation(
                "burst",
                format!("must be a finite number of at least 1, got {}", burst),
            ));
        }

        Ok(Self {
            rate,
            capacity: burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            stopped: CancellationToken::new(),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Wait until `n` tokens are available, then consume them
    ///
    /// A request larger than the capacity waits for a full bucket and then
    /// leaves it in debt, which later callers pay off by waiting. Returns
    /// [`ProxyError::Cancelled`] if `cancel` fires first, in which case no
    /// tokens are consumed, and [`ProxyError::LimiterStopped`] once the
    /// limiter has been stopped.
    pub async fn admit(&self, n: usize, cancel: &CancellationToken) -> Result<(), ProxyError> {
        if self.stopped.is_cancelled() {
            return Err(ProxyError::LimiterStopped);
        }
        if n == 0 {
            return Ok(());
        }
        let cost = n as f64;
        let required = cost.min(self.capacity);

        loop {
            if self.stopped.is_cancelled() {
                return Err(ProxyError::LimiterStopped);
            }
            if cancel.is_cancelled() {
                return Err(ProxyError::Cancelled);
            }

            let wait = {
                let mut bucket = self.lock();
                bucket.refill(Instant::now(), self.rate, self.capacity);
                if bucket.tokens >= required {
                    bucket.tokens -= cost;
                    return Ok(());
                }
                // Saturates for tiny rates or deep debt; tokio treats it as never
                Duration::try_from_secs_f64((required - bucket.tokens) / self.rate).unwrap_or(Duration::MAX)
            };

            debug!(tokens = n, wait_ms = wait.as_millis() as u64, "Rate limiter delaying admission");
            tokio::select! {
                _ = sleep(wait) => {}
                _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                _ = self.stopped.cancelled() => return Err(ProxyError::LimiterStopped),
            }
        }
    }

    /// Stop the limiter. Pending and future admissions fail with
    /// [`ProxyError::LimiterStopped`]. Safe to call repeatedly.
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Tokens currently available, after refilling (negative while in debt)
    pub fn available(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill(Instant::now(), self.rate, self.capacity);
        bucket.tokens
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
