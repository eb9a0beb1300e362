//! A schema-driven WebSocket application framework: a transport- and
//! validator-agnostic message registry, dispatcher, RPC engine, per-
//! connection Topics set, and pub/sub fan-out, following the same module
//! split the application crate this was grown out of uses for its own
//! request pipeline (`app.rs` / `frontend/` / `errors.rs`).

pub mod axum_transport;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod messaging;
pub mod middleware;
pub mod pubsub;
pub mod ratelimit;
pub mod registry;
pub mod rpc;
pub mod testing;
pub mod topics;
pub mod transport;
pub mod validator;

pub use config::RouterConfig;
pub use context::Context;
pub use dispatcher::Dispatcher;
pub use error::{ErrorCode, WsError, WsRouterError, WsRouterErrorContext, WsRouterResult};
pub use middleware::{Middleware, MiddlewareChain};
pub use registry::{MessageDescriptor, MessageKind, MessageRegistry};
pub use validator::ValidatorAdapter;
