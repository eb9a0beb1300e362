//! The per-frame context (spec §3 "Connection data", §4.4 step 6, §9 "Plugin
//! composition & context extension"). Owned by the dispatcher for the
//! duration of one message; middleware and the handler borrow it read-write.

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::warn;

use crate::connection::{ConnectionData, SharedFields};
use crate::envelope::{extract_correlation_id, OutEnvelope};
use crate::error::{ErrorCode, WsError};
use crate::messaging::{self, SendOptions};
use crate::rpc::{CancelCallback, RpcHandle};
use crate::transport::{ConnectionSink, OutboundData};

/// Tagged capability records attached at the `extensions` well-defined
/// extension point (design notes §9), instead of ad hoc dynamic method
/// injection.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast::<T>().ok().map(|b| *b))
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map.get(&TypeId::of::<T>()).and_then(|b| b.downcast_ref())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.map.get_mut(&TypeId::of::<T>()).and_then(|b| b.downcast_mut())
    }
}

struct RpcContext {
    handle: RpcHandle,
}

/// `{ type, payload, meta, data, ws, clientId, extensions }` plus, for RPC
/// contexts, `reply`/`progress`/`onCancel`/`deadline`/`timeRemaining`
/// (spec §4.4 step 6).
pub struct Context {
    pub message_type: String,
    pub payload: Option<Value>,
    pub meta: Map<String, Value>,
    pub client_id: String,
    pub received_at_ms: i64,
    pub data: SharedFields,
    pub ws: Arc<dyn ConnectionSink>,
    pub extensions: Extensions,
    rpc: Option<RpcContext>,
}

impl Context {
    pub fn new_event(
        message_type: String,
        payload: Option<Value>,
        meta: Map<String, Value>,
        connection: ConnectionData,
        ws: Arc<dyn ConnectionSink>,
    ) -> Self {
        Self {
            message_type,
            payload,
            meta,
            client_id: connection.client_id,
            received_at_ms: crate::connection::now_ms(),
            data: connection.fields,
            ws,
            extensions: Extensions::new(),
            rpc: None,
        }
    }

    pub fn new_rpc(
        message_type: String,
        payload: Option<Value>,
        meta: Map<String, Value>,
        connection: ConnectionData,
        ws: Arc<dyn ConnectionSink>,
        rpc_handle: RpcHandle,
    ) -> Self {
        Self {
            message_type,
            payload,
            meta,
            client_id: connection.client_id,
            received_at_ms: crate::connection::now_ms(),
            data: connection.fields,
            ws,
            extensions: Extensions::new(),
            rpc: Some(RpcContext { handle: rpc_handle }),
        }
    }

    pub fn is_rpc(&self) -> bool {
        self.rpc.is_some()
    }

    /// A cheap clone of this context's RPC handle, if any — used by the
    /// dispatcher to keep terminal-error routing available after a handler
    /// has consumed the context by value.
    pub fn rpc_handle(&self) -> Option<RpcHandle> {
        self.rpc.as_ref().map(|r| r.handle.clone())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.rpc.as_ref().map(|r| r.handle.correlation_id())
    }

    /// `ctx.timeRemaining()` (spec §4.6): `max(0, deadline - now)` for RPC
    /// contexts, effectively infinite for event contexts.
    pub fn time_remaining(&self) -> Duration {
        self.rpc
            .as_ref()
            .map(|r| r.handle.deadline_remaining())
            .unwrap_or(Duration::MAX)
    }

    /// One-shot terminal reply. No-op (returns `false`) outside an RPC
    /// context or once this RPC already terminated.
    pub fn reply(&self, payload: Value) -> bool {
        match &self.rpc {
            Some(rpc) => rpc.handle.reply(payload),
            None => {
                warn!(message_type = %self.message_type, "reply() called on a non-rpc context");
                false
            }
        }
    }

    /// For RPC contexts: one-shot terminal `$ws:rpc-error`. For event
    /// contexts: a non-fatal `ERROR` envelope (spec §4.4 step 4, §7).
    pub fn error(&self, code: ErrorCode, message: impl Into<Cow<'static, str>>, details: Option<Value>) -> bool {
        if let Some(rpc) = &self.rpc {
            return rpc.handle.error(code, message, details);
        }

        let mut err = WsError::new(code, message);
        if let Some(details) = details {
            err = err.with_details(details);
        }

        let env = OutEnvelope::new("ERROR").with_payload(match serde_json::to_value(&err) {
            Ok(v) => v,
            Err(e) => {
                warn!(?e, "failed to serialize error payload");
                return false;
            }
        });

        match env.to_json_string() {
            Ok(text) => {
                self.ws.send(OutboundData::text(text));
                true
            }
            Err(e) => {
                warn!(?e, "failed to serialize error envelope");
                false
            }
        }
    }

    /// Leading-edge throttled progress update. No-op outside an RPC context.
    pub fn progress(&self, update: Value, throttle: Duration) -> bool {
        match &self.rpc {
            Some(rpc) => rpc.handle.progress(update, throttle),
            None => false,
        }
    }

    /// Registers a cancel callback. Silently dropped outside an RPC context.
    pub fn on_cancel(&self, callback: CancelCallback) {
        if let Some(rpc) = &self.rpc {
            rpc.handle.on_cancel(callback);
        }
    }

    /// `ctx.send(type, payload, opts)` (spec §4.5).
    pub fn send(&self, message_type: impl Into<String>, payload: Option<Value>, opts: SendOptions) -> bool {
        let inbound_correlation_id = self
            .correlation_id()
            .map(str::to_string)
            .or_else(|| extract_correlation_id(&self.meta));

        messaging::send(&*self.ws, message_type, payload, inbound_correlation_id.as_deref(), opts)
    }
}
