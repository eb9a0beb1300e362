//! Pluggable rate-limit backend contract, plus an in-memory reference bucket.
//!
//! The framework only depends on the [`RateLimiter`] trait. Swap in a redis-
//! backed or otherwise distributed implementation without touching the
//! middleware that calls it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use derive_more::{Display, Error};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

pub type RateLimitResult<T> = Result<T, RateLimiterError>;

#[derive(Debug, Display, Error)]
pub enum RateLimiterError {
    #[display(fmt = "rate limiter backend unavailable")]
    BackendUnavailable,
}

/// Static description of a bucket: how big it is and how fast it refills.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub capacity: u64,
    /// tokens added per `refill_interval`
    pub refill_amount: u64,
    pub refill_interval: Duration,
}

impl Policy {
    pub fn per_minute(capacity: u64) -> Self {
        Self {
            capacity,
            refill_amount: capacity,
            refill_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Consumption {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_ms: Option<u64>,
}

/// The contract `ws-router`'s rate-limit middleware consumes. `consume` MUST
/// be atomic per-key: concurrent callers for the same key never both observe
/// `allowed: true` when only one token remains.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn consume(&self, key: &str, cost: u64) -> RateLimitResult<Consumption>;

    fn policy(&self) -> Policy;
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// In-process token bucket per key. Reference implementation; not shared
/// across processes. A production deployment behind a broker would swap this
/// for a redis-backed `RateLimiter`, same trait.
pub struct LocalTokenBucketLimiter {
    policy: Policy,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl LocalTokenBucketLimiter {
    pub fn new(policy: Policy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    fn refill_rate_per_ms(&self) -> f64 {
        self.policy.refill_amount as f64 / self.policy.refill_interval.as_millis().max(1) as f64
    }
}

#[async_trait]
impl RateLimiter for LocalTokenBucketLimiter {
    async fn consume(&self, key: &str, cost: u64) -> RateLimitResult<Consumption> {
        let rate_per_ms = self.refill_rate_per_ms();
        let now = Instant::now();

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.policy.capacity as f64,
            last_refill: now,
        });

        let elapsed_ms = now.saturating_duration_since(bucket.last_refill).as_millis() as f64;
        bucket.tokens = (bucket.tokens + elapsed_ms * rate_per_ms).min(self.policy.capacity as f64);
        bucket.last_refill = now;

        let cost = cost as f64;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;

            trace!(%key, cost, remaining = bucket.tokens, "rate limit consume allowed");

            Ok(Consumption {
                allowed: true,
                remaining: bucket.tokens as u64,
                retry_after_ms: None,
            })
        } else {
            let deficit = cost - bucket.tokens;
            let retry_after_ms = if rate_per_ms > 0.0 {
                Some((deficit / rate_per_ms).ceil() as u64)
            } else {
                None
            };

            trace!(%key, cost, remaining = bucket.tokens, retry_after_ms, "rate limit consume denied");

            Ok(Consumption {
                allowed: false,
                remaining: bucket.tokens as u64,
                retry_after_ms,
            })
        }
    }

    fn policy(&self) -> Policy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_capacity_then_denies() {
        let limiter = LocalTokenBucketLimiter::new(Policy {
            capacity: 2,
            refill_amount: 2,
            refill_interval: Duration::from_secs(60),
        });

        assert!(limiter.consume("k", 1).await.unwrap().allowed);
        assert!(limiter.consume("k", 1).await.unwrap().allowed);

        let denied = limiter.consume("k", 1).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms.is_some());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = LocalTokenBucketLimiter::new(Policy::per_minute(1));

        assert!(limiter.consume("a", 1).await.unwrap().allowed);
        assert!(limiter.consume("b", 1).await.unwrap().allowed);
        assert!(!limiter.consume("a", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn zero_cost_is_always_allowed() {
        let limiter = LocalTokenBucketLimiter::new(Policy {
            capacity: 0,
            refill_amount: 0,
            refill_interval: Duration::from_secs(60),
        });

        assert!(limiter.consume("k", 0).await.unwrap().allowed);
    }
}
