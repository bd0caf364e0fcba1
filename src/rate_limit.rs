//! Token-bucket rate limiter.
//!
//! Tokens refill continuously at `refill_rate` per second up to `capacity`.
//! A caller that finds the bucket empty reserves the next token (the balance
//! goes negative) and then sleeps exactly until that token exists, so every
//! wait is a single suspension on the caller's [`CancelNode`].

use crate::cancel::CancelNode;
use crate::config::RateLimitConfig;
use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug)]
struct Bucket {
    /// Negative while callers hold reservations on future tokens
    tokens: f64,
    last_refill: Instant,
}

/// Shared token bucket; clones throttle against the same budget
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
    capacity: f64,
    refill_rate: f64,
}

impl RateLimiter {
    /// Create a full bucket holding `capacity` tokens, refilled at
    /// `refill_rate` tokens per second
    pub fn new(capacity: u32, refill_rate: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::ConfigError(
                "rate limiter burst capacity must be at least 1".into(),
            ));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(PipelineError::ConfigError(format!(
                "rate limiter refill rate must be positive and finite, got {}",
                refill_rate
            )));
        }
        Ok(Self {
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            })),
            capacity: f64::from(capacity),
            refill_rate,
        })
    }

    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        Self::new(config.burst, config.tokens_per_second)
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Take one token, waiting for it if necessary.
    ///
    /// Fails with `Cancelled`/`DeadlineExceeded` if `node` finishes before the
    /// token is available; the reservation is then returned to the bucket.
    pub fn acquire(&self, node: &CancelNode) -> Result<()> {
        node.check()?;

        let wait = {
            let mut bucket = self.bucket.lock();
            self.refill(&mut bucket, Instant::now());
            bucket.tokens -= 1.0;
            if bucket.tokens >= 0.0 {
                return Ok(());
            }
            Duration::try_from_secs_f64(-bucket.tokens / self.refill_rate).ok()
        };

        // No representable wait means the token will never arrive in practice.
        let woken = match wait {
            Some(wait) => {
                trace!(wait_us = wait.as_micros() as u64, "rate limited, waiting for token");
                node.wait_timeout(wait)
            }
            None => {
                trace!("rate limited beyond any representable wait");
                Some(node.wait())
            }
        };
        match woken {
            None => Ok(()),
            Some(reason) => {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket, Instant::now());
                bucket.tokens = (bucket.tokens + 1.0).min(self.capacity);
                Err(reason.into())
            }
        }
    }

    /// Take one token only if it is available right now
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available; negative while callers are waiting
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}
