//! RPC engine (spec §4.6): registration, the unicast reply/progress/error
//! surface handlers see as `ctx.reply`/`ctx.progress`/`ctx.error`, per-socket
//! inflight bookkeeping, duplicate-correlation rejection, backpressure, and
//! the idle sweeper.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::envelope::{OutEnvelope, CONTROL_RPC_ERROR, CONTROL_RPC_PROGRESS};
use crate::error::{ErrorCode, WsError, WsRouterError, WsRouterResult};
use crate::rpc::state::{CancelCallback, RpcState};
use crate::transport::{ConnectionSink, OutboundData};

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub default_timeout_ms: u64,
    /// Fixed at `timeoutMs + 10s` per spec §9's resolved open question.
    pub idle_timeout_extra_ms: u64,
    pub max_inflight_per_socket: usize,
    pub socket_buffer_limit_bytes: u64,
    pub sweep_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            idle_timeout_extra_ms: 10_000,
            max_inflight_per_socket: 1000,
            socket_buffer_limit_bytes: 16 * 1024 * 1024,
            sweep_interval_ms: 5_000,
        }
    }
}

/// Builds the wire envelope for a unicast RPC error, usable both by
/// [`RpcHandle::error`] and by the dispatcher for pre-registration
/// rejections (duplicate correlation, inflight cap) that never get a state.
pub fn build_rpc_error_envelope(correlation_id: &str, err: &WsError) -> OutEnvelope {
    OutEnvelope::new(CONTROL_RPC_ERROR)
        .with_correlation_id(correlation_id.to_string())
        .with_payload(serde_json::to_value(err).expect("WsError always serializes"))
}

pub struct RpcEngine {
    config: RpcConfig,
    per_socket: DashMap<String, DashMap<String, Arc<RpcState>>>,
}

impl RpcEngine {
    pub fn new(config: RpcConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            per_socket: DashMap::new(),
        })
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Registers fresh RPC state for `(clientId, correlationId)`. Enforces
    /// duplicate-correlation rejection and the per-socket inflight cap
    /// before any handler runs (spec §4.6, §4.4 step 8).
    pub fn register(
        &self,
        client_id: &str,
        correlation_id: &str,
        response_message_type: &str,
        timeout_ms: Option<u64>,
    ) -> WsRouterResult<Arc<RpcState>> {
        let timeout_ms = timeout_ms
            .filter(|&t| t > 0)
            .unwrap_or(self.config.default_timeout_ms);
        let idle_ms = timeout_ms + self.config.idle_timeout_extra_ms;

        let socket_map = self
            .per_socket
            .entry(client_id.to_string())
            .or_insert_with(DashMap::new);

        // Duplicate-correlation rejection is independent of the inflight cap
        // and must not consume a slot (spec: a duplicate `(clientId,
        // correlationId)` is ALWAYS rejected as ALREADY_EXISTS, even when the
        // socket is already at capacity).
        match socket_map.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => Err(WsRouterError::AlreadyExists(
                format!("rpc correlation {} already in flight", correlation_id).into(),
            )),
            Entry::Vacant(vacant) => {
                if socket_map.len() >= self.config.max_inflight_per_socket {
                    return Err(WsRouterError::ResourceExhausted {
                        message: "too many inflight rpcs for this connection".into(),
                        retry_after_ms: Some(50),
                    });
                }

                let state = Arc::new(RpcState::new(
                    client_id.to_string(),
                    correlation_id.to_string(),
                    response_message_type.to_string(),
                    Instant::now(),
                    timeout_ms,
                    idle_ms,
                ));
                vacant.insert(state.clone());
                Ok(state)
            }
        }
    }

    pub fn get(&self, client_id: &str, correlation_id: &str) -> Option<Arc<RpcState>> {
        self.per_socket
            .get(client_id)?
            .get(correlation_id)
            .map(|e| e.value().clone())
    }

    /// Removes state for a single correlation, cleaning up the per-socket
    /// map entry if it becomes empty (spec §4.6 "state pruning").
    pub fn prune(&self, client_id: &str, correlation_id: &str) -> Option<Arc<RpcState>> {
        let removed = self
            .per_socket
            .get(client_id)
            .and_then(|map| map.remove(correlation_id))
            .map(|(_, v)| v);

        let now_empty = self.per_socket.get(client_id).map(|m| m.is_empty()).unwrap_or(false);
        if now_empty {
            self.per_socket.remove(client_id);
        }

        removed
    }

    /// Cancels a single RPC exactly as `$ws:abort` or an idle sweep would:
    /// fires cancel callbacks then prunes.
    pub fn cancel(&self, client_id: &str, correlation_id: &str) {
        if let Some(state) = self.prune(client_id, correlation_id) {
            trace!(%client_id, %correlation_id, "cancelling rpc");
            state.fire_cancel();
        }
    }

    /// Socket close: cancel every inflight RPC for this connection (spec
    /// §4.4 "On close" step 2).
    pub fn cancel_all_for_socket(&self, client_id: &str) {
        if let Some((_, map)) = self.per_socket.remove(client_id) {
            for (_, state) in map {
                state.fire_cancel();
            }
        }
    }

    pub fn inflight_count(&self, client_id: &str) -> usize {
        self.per_socket.get(client_id).map(|m| m.len()).unwrap_or(0)
    }

    /// Scans all RPC states for deadline/idle-window expiry and cancels
    /// them (spec §4.6 "idle sweeper").
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();

        for entry in self.per_socket.iter() {
            let client_id = entry.key().clone();
            for inner in entry.value().iter() {
                if inner.value().is_expired(now) {
                    expired.push((client_id.clone(), inner.key().clone()));
                }
            }
        }

        for (client_id, correlation_id) in expired {
            self.cancel(&client_id, &correlation_id);
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let interval = Duration::from_millis(self.config.sweep_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                engine.sweep_idle();
            }
        })
    }
}

/// Per-message `ctx.reply`/`ctx.progress`/`ctx.error`/`ctx.onCancel` surface.
/// Unicast invariant: every send here goes to `sink` only (spec §4.6). Cheap
/// to clone (every field is an `Arc`) so the dispatcher can keep a handle
/// around for terminal-error routing after a handler consumes the context.
#[derive(Clone)]
pub struct RpcHandle {
    state: Arc<RpcState>,
    engine: Arc<RpcEngine>,
    sink: Arc<dyn ConnectionSink>,
}

impl RpcHandle {
    pub fn new(state: Arc<RpcState>, engine: Arc<RpcEngine>, sink: Arc<dyn ConnectionSink>) -> Self {
        Self { state, engine, sink }
    }

    pub fn correlation_id(&self) -> &str {
        &self.state.correlation_id
    }

    pub fn deadline_remaining(&self) -> Duration {
        self.state.time_remaining()
    }

    pub fn is_replied(&self) -> bool {
        self.state.is_replied()
    }

    pub fn on_cancel(&self, callback: CancelCallback) {
        self.state.on_cancel(callback);
    }

    /// Idempotent no-op once replied (spec §4.6 one-shot guard).
    pub fn reply(&self, payload: Value) -> bool {
        if !self.state.try_terminate() {
            trace!(correlation_id = %self.state.correlation_id, "reply after terminal: ignored");
            return false;
        }

        self.send_terminal(Ok(payload));
        true
    }

    pub fn error(&self, code: ErrorCode, message: impl Into<std::borrow::Cow<'static, str>>, details: Option<Value>) -> bool {
        if !self.state.try_terminate() {
            trace!(correlation_id = %self.state.correlation_id, "error after terminal: ignored");
            return false;
        }

        let mut err = WsError::new(code, message);
        if let Some(details) = details {
            err = err.with_details(details);
        }

        self.send_terminal(Err(err));
        true
    }

    /// Leading-edge throttled, dropped entirely after the terminal send
    /// (spec §4.6 "Progress throttling").
    pub fn progress(&self, update: Value, throttle: Duration) -> bool {
        if !self.state.should_emit_progress(throttle) {
            return false;
        }

        let env = OutEnvelope::new(CONTROL_RPC_PROGRESS)
            .with_correlation_id(self.state.correlation_id.clone())
            .with_payload(update);

        self.emit(env);
        true
    }

    fn send_terminal(&self, result: Result<Value, WsError>) {
        let over_buffered = self
            .sink
            .buffered_amount()
            .map(|buffered| buffered > self.engine.config.socket_buffer_limit_bytes)
            .unwrap_or(false);

        let env = if over_buffered {
            warn!(correlation_id = %self.state.correlation_id, "backpressure: sending RESOURCE_EXHAUSTED instead of terminal reply");
            let err = WsError::new(ErrorCode::ResourceExhausted, "socket buffer limit exceeded")
                .retryable(Some(250));
            build_rpc_error_envelope(&self.state.correlation_id, &err)
        } else {
            match result {
                Ok(payload) => OutEnvelope::new(self.state.response_message_type.clone())
                    .with_correlation_id(self.state.correlation_id.clone())
                    .with_payload(payload),
                Err(err) => build_rpc_error_envelope(&self.state.correlation_id, &err),
            }
        };

        self.emit(env);
        self.engine.prune(&self.state.client_id, &self.state.correlation_id);
    }

    fn emit(&self, env: OutEnvelope) {
        match env.to_json_string() {
            Ok(text) => self.sink.send(OutboundData::text(text)),
            Err(err) => warn!(?err, "failed to serialize outbound rpc envelope"),
        }
    }
}
