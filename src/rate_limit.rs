// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Rate Limiting
//!
//! The worker takes one token per delivery. When none is left it waits for the
//! next one, which is the only place besides broker I/O where it waits on purpose.

use async_trait::async_trait;
use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::time::Instant;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Takes one token if available.
    fn try_consume(&self) -> bool;

    /// Waits until a token is available and takes it.
    async fn wait(&self);
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Allows `limit` tokens per `interval`, refilled continuously.
#[derive(Debug)]
pub struct TokenBucket {
    limit: f64,
    interval: Duration,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(limit: u32, interval: Duration) -> TokenBucket {
        TokenBucket {
            limit: f64::from(limit.max(1)),
            interval: interval.max(Duration::from_millis(1)),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(limit.max(1)),
                refilled_at: Instant::now(),
            }),
        }
    }

    fn per_token(&self) -> Duration {
        self.interval.div_f64(self.limit)
    }

    /// Refills, then takes a token or returns how long until the next one.
    fn take(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at);
        let refill = elapsed.as_secs_f64() / self.interval.as_secs_f64() * self.limit;
        bucket.tokens = (bucket.tokens + refill).min(self.limit);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        Err(self.per_token().mul_f64(1.0 - bucket.tokens))
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    fn try_consume(&self) -> bool {
        self.take().is_ok()
    }

    async fn wait(&self) {
        while let Err(wait) = self.take() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rejects_once_the_bucket_is_empty() {
        let limiter = TokenBucket::new(2, Duration::from_secs(1));

        assert!(limiter.try_consume());
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_when_a_token_is_refilled() {
        let limiter = TokenBucket::new(1, Duration::from_secs(10));
        assert!(limiter.try_consume());

        let started = Instant::now();
        limiter.wait().await;

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!limiter.try_consume());
    }
}
