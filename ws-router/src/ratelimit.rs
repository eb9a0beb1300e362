//! Rate-limit middleware (spec §4.9). Wraps a [`RateLimiter`] backend behind
//! the standard [`Middleware`] seam so it composes with any other chain
//! entry.

use std::sync::Arc;

use async_trait::async_trait;
use rate_limiter::RateLimiter;

use crate::context::Context;
use crate::error::{WsRouterError, WsRouterResult};
use crate::middleware::Middleware;

/// `key(ctx) -> String`. Defaults to `tenant:user:type`, reading `tenant`/
/// `user` out of `ctx.data` and falling back to `"-"` when absent (spec
/// §4.9 "Keys are derived via a `key(ctx)` function").
pub type KeyFn = Box<dyn Fn(&Context) -> String + Send + Sync>;

pub fn default_key(ctx: &Context) -> String {
    let data = ctx.data.lock();
    let tenant = data.get("tenant").and_then(|v| v.as_str()).unwrap_or("-").to_string();
    let user = data.get("user").and_then(|v| v.as_str()).unwrap_or("-").to_string();
    format!("{}:{}:{}", tenant, user, ctx.message_type)
}

/// `cost(ctx) -> u64`. Defaults to a flat cost of 1 per message.
pub type CostFn = Box<dyn Fn(&Context) -> u64 + Send + Sync>;

pub struct RateLimitMiddleware {
    limiter: Arc<dyn RateLimiter>,
    key_fn: KeyFn,
    cost_fn: CostFn,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            key_fn: Box::new(default_key),
            cost_fn: Box::new(|_ctx| 1),
        }
    }

    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }

    pub fn with_cost_fn(mut self, cost_fn: CostFn) -> Self {
        self.cost_fn = cost_fn;
        self
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(&self, ctx: &mut Context) -> WsRouterResult<()> {
        let cost = (self.cost_fn)(ctx);
        if cost == 0 {
            return Ok(());
        }

        let capacity = self.limiter.policy().capacity;
        if cost > capacity {
            return Err(WsRouterError::FailedPrecondition(
                format!("rate limit cost {} exceeds bucket capacity {}", cost, capacity).into(),
            ));
        }

        let key = (self.key_fn)(ctx);
        let consumption = self
            .limiter
            .consume(&key, cost)
            .await
            .map_err(|err| WsRouterError::Anyhow(err.into()))?;

        if !consumption.allowed {
            return Err(WsRouterError::ResourceExhausted {
                message: "rate limit exceeded".into(),
                retry_after_ms: consumption.retry_after_ms,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionData;
    use crate::transport::{ConnectionSink, OutboundData, ReadyState};
    use rate_limiter::{LocalTokenBucketLimiter, Policy};
    use serde_json::Map;

    struct NullSink;
    impl ConnectionSink for NullSink {
        fn send(&self, _data: OutboundData) {}
        fn close(&self, _code: Option<u16>, _reason: Option<String>) {}
        fn ready_state(&self) -> ReadyState {
            ReadyState::Open
        }
    }

    fn test_ctx() -> Context {
        Context::new_event("PING".into(), None, Map::new(), ConnectionData::new("c1"), Arc::new(NullSink))
    }

    #[tokio::test]
    async fn allows_under_capacity_then_exhausts() {
        let limiter = LocalTokenBucketLimiter::new(Policy {
            capacity: 1,
            refill_amount: 1,
            refill_interval: std::time::Duration::from_secs(60),
        });
        let middleware = RateLimitMiddleware::new(limiter);

        let mut ctx = test_ctx();
        middleware.handle(&mut ctx).await.unwrap();

        let err = middleware.handle(&mut ctx).await.unwrap_err();
        assert!(matches!(err, WsRouterError::ResourceExhausted { .. }));
    }

    #[tokio::test]
    async fn cost_above_capacity_is_a_failed_precondition() {
        let limiter = LocalTokenBucketLimiter::new(Policy::per_minute(5));
        let middleware = RateLimitMiddleware::new(limiter).with_cost_fn(Box::new(|_| 10));

        let mut ctx = test_ctx();
        let err = middleware.handle(&mut ctx).await.unwrap_err();
        assert!(matches!(err, WsRouterError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn zero_cost_bypasses_the_limiter() {
        let limiter = LocalTokenBucketLimiter::new(Policy {
            capacity: 0,
            refill_amount: 0,
            refill_interval: std::time::Duration::from_secs(60),
        });
        let middleware = RateLimitMiddleware::new(limiter).with_cost_fn(Box::new(|_| 0));

        let mut ctx = test_ctx();
        middleware.handle(&mut ctx).await.unwrap();
    }
}
