//! RPC support (spec §3 "RPC state", §4.6): per-correlation state, the
//! engine that owns it per socket, and the `ctx.reply`/`progress`/`error`
//! handle surface built on top.

mod engine;
mod state;

pub use engine::{build_rpc_error_envelope, RpcConfig, RpcEngine, RpcHandle};
pub use state::{CancelCallback, RpcState};
