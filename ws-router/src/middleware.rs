//! Middleware chain (spec §4.4 step 7, §2). Composed in registration order;
//! a middleware short-circuits the chain by returning `Err` — the dispatcher
//! never calls the handler once any middleware in the chain has errored,
//! matching "if it calls `ctx.error(...)` it MUST NOT call `next()`" without
//! needing a hand-rolled continuation-passing chain.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::WsRouterResult;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut Context) -> WsRouterResult<()>;
}

#[derive(Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Cheap `Arc` clone of the chain, taken so a caller never holds the
    /// chain's own lock across an `.await`.
    pub fn snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares.clone()
    }

    /// Runs every middleware in registration order. The first `Err` stops
    /// the chain immediately — the caller (the dispatcher) treats that as
    /// "do not invoke the handler."
    pub async fn run(&self, ctx: &mut Context) -> WsRouterResult<()> {
        for middleware in &self.middlewares {
            middleware.handle(ctx).await?;
        }
        Ok(())
    }
}
