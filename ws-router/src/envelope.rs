//! The wire envelope (spec §3) and the reserved control-frame prefix.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Types beginning with this prefix are never dispatched to user handlers.
pub const CONTROL_PREFIX: &str = "$ws:";

pub const CONTROL_ABORT: &str = "$ws:abort";
pub const CONTROL_RPC_PROGRESS: &str = "$ws:rpc-progress";
pub const CONTROL_RPC_ERROR: &str = "$ws:rpc-error";

/// Keys the engine writes into `meta` itself; applications may never define
/// or set these from an inbound frame or from `ctx.send` options.
pub const RESERVED_META_KEYS: &[&str] = &["clientId", "receivedAt"];

/// Keys `ctx.send(..., opts)` is not allowed to override.
pub const NON_OVERRIDABLE_SEND_META_KEYS: &[&str] = &["type", "correlationId"];

pub fn is_control_type(message_type: &str) -> bool {
    message_type.starts_with(CONTROL_PREFIX)
}

/// Raw inbound frame as parsed from JSON, before reserved-key stripping or
/// validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Outbound frame. `payload` is omitted entirely from the wire when absent
/// (spec §4.5: "payload === undefined means: omit the payload key").
#[derive(Debug, Clone, Serialize)]
pub struct OutEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub meta: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl OutEnvelope {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            meta: Map::new(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.meta
            .insert("correlationId".to_string(), Value::String(correlation_id.into()));
        self
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Strip reserved server-only keys from an inbound `meta` map (spec §3, §4.4
/// step 5). Returns the keys that were actually present, for logging.
pub fn strip_reserved_meta(meta: &mut Map<String, Value>) -> Vec<String> {
    let mut stripped = Vec::new();
    for key in RESERVED_META_KEYS {
        if meta.remove(*key).is_some() {
            stripped.push((*key).to_string());
        }
    }
    stripped
}

pub fn extract_correlation_id(meta: &Map<String, Value>) -> Option<String> {
    meta.get("correlationId")
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub fn extract_timeout_ms(meta: &Map<String, Value>) -> Option<u64> {
    meta.get("timeoutMs").and_then(Value::as_u64).filter(|&t| t > 0)
}
