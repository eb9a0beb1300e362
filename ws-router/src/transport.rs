//! Transport adapter contract (spec §4.3). The core never imports a
//! concrete WebSocket runtime — it only ever holds a [`ConnectionSink`] per
//! connection. Bridging a real runtime (open/message/close callbacks) lives
//! in adapter-specific modules such as [`crate::axum_transport`].

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub enum OutboundData {
    Text(String),
    Binary(Vec<u8>),
}

impl OutboundData {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }
}

/// Per-connection send handle. `send` is a synchronous enqueue: it never
/// blocks on the network, and a failing transport must not propagate into
/// the caller (spec §4.5 default-send semantics).
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    fn send(&self, data: OutboundData);

    fn close(&self, code: Option<u16>, reason: Option<String>);

    fn ready_state(&self) -> ReadyState;

    fn buffered_amount(&self) -> Option<u64> {
        None
    }
}
