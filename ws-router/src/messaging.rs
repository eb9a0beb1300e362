//! `ctx.send` (spec §4.5): envelope construction, reserved-meta sanitizing,
//! optional correlation preservation. A thin free-function module — `Context`
//! delegates to it rather than duplicating the envelope-building logic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::envelope::{OutEnvelope, NON_OVERRIDABLE_SEND_META_KEYS};
use crate::transport::{ConnectionSink, OutboundData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    Drain,
    Ack,
}

/// Cooperative pre-enqueue abort flag (spec §4.5 `opts.signal`). Aborting
/// after enqueue is advisory only, so there is nothing to check post-send.
pub type SendSignal = Arc<AtomicBool>;

#[derive(Default)]
pub struct SendOptions {
    pub meta: Map<String, Value>,
    pub preserve_correlation: bool,
    pub wait_for: Option<WaitFor>,
    pub signal: Option<SendSignal>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = meta;
        self
    }

    pub fn preserve_correlation(mut self) -> Self {
        self.preserve_correlation = true;
        self
    }

    pub fn wait_for(mut self, wait_for: WaitFor) -> Self {
        self.wait_for = Some(wait_for);
        self
    }

    pub fn signal(mut self, signal: SendSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Builds and enqueues `{ type, meta, payload? }`. Returns `false` if the
/// send was skipped (pre-enqueue abort) or failed to serialize; never
/// propagates a transport failure into the caller (spec §4.5 default form).
///
/// `wait_for` is honored trivially here: [`ConnectionSink::send`] is a
/// synchronous enqueue, so both `drain` and `ack` are already true the
/// instant the frame is handed to the sink.
pub fn send(
    sink: &dyn ConnectionSink,
    message_type: impl Into<String>,
    payload: Option<Value>,
    inbound_correlation_id: Option<&str>,
    opts: SendOptions,
) -> bool {
    if let Some(signal) = &opts.signal {
        if signal.load(Ordering::SeqCst) {
            return false;
        }
    }

    let mut meta = opts.meta;
    for key in NON_OVERRIDABLE_SEND_META_KEYS {
        meta.remove(*key);
    }

    if opts.preserve_correlation {
        if let Some(correlation_id) = inbound_correlation_id {
            meta.insert("correlationId".to_string(), Value::String(correlation_id.to_string()));
        }
    }

    let mut env = OutEnvelope::new(message_type);
    env.meta = meta;
    if let Some(payload) = payload {
        env = env.with_payload(payload);
    }

    match env.to_json_string() {
        Ok(text) => {
            sink.send(OutboundData::text(text));
            true
        }
        Err(err) => {
            warn!(?err, "failed to serialize outbound envelope, dropping send");
            false
        }
    }
}
