//! In-memory transport + harness (spec §4.3 "a reference in-process adapter
//! is always provided for tests"). No network, no serialization round-trip
//! beyond what the dispatcher itself does — a scripted stand-in for a real
//! transport adapter, used by this crate's own integration tests and
//! available to downstream application tests.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::ConnectionData;
use crate::dispatcher::Dispatcher;
use crate::transport::{ConnectionSink, OutboundData, ReadyState};
use crate::validator::ValidatorAdapter;

/// A `ConnectionSink` that records every frame instead of writing to a
/// socket, with a settable `readyState` so tests can exercise backpressure
/// and closed-connection paths.
pub struct RecordingSink {
    sent: Mutex<Vec<OutboundData>>,
    ready_state: Mutex<ReadyState>,
    buffered_amount: Mutex<Option<u64>>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            ready_state: Mutex::new(ReadyState::Open),
            buffered_amount: Mutex::new(None),
        }
    }
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        *self.ready_state.lock() = state;
    }

    pub fn set_buffered_amount(&self, amount: Option<u64>) {
        *self.buffered_amount.lock() = amount;
    }

    /// Text frames sent so far, in order.
    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|d| match d {
                OutboundData::Text(t) => Some(t.clone()),
                OutboundData::Binary(_) => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl ConnectionSink for RecordingSink {
    fn send(&self, data: OutboundData) {
        self.sent.lock().push(data);
    }

    fn close(&self, _code: Option<u16>, _reason: Option<String>) {
        *self.ready_state.lock() = ReadyState::Closed;
    }

    fn ready_state(&self) -> ReadyState {
        *self.ready_state.lock()
    }

    fn buffered_amount(&self) -> Option<u64> {
        *self.buffered_amount.lock()
    }
}

/// One scripted connection against a [`Dispatcher`]: owns the `ConnectionData`
/// and a `RecordingSink`, and drives `open`/`message`/`close` the way a real
/// transport adapter would.
pub struct TestConnection<V: ValidatorAdapter + 'static> {
    dispatcher: Arc<Dispatcher<V>>,
    conn: ConnectionData,
    sink: Arc<RecordingSink>,
    sink_dyn: Arc<dyn ConnectionSink>,
}

impl<V: ValidatorAdapter + 'static> TestConnection<V> {
    pub fn open(dispatcher: Arc<Dispatcher<V>>, client_id: impl Into<String>) -> Self {
        let conn = ConnectionData::new(client_id);
        let sink = RecordingSink::new();
        let sink_dyn: Arc<dyn ConnectionSink> = sink.clone();

        dispatcher.handle_open(&conn, sink_dyn.clone());

        Self {
            dispatcher,
            conn,
            sink,
            sink_dyn,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.conn.client_id
    }

    pub fn connection_data(&self) -> &ConnectionData {
        &self.conn
    }

    pub fn sink(&self) -> &Arc<RecordingSink> {
        &self.sink
    }

    pub async fn send_raw(&self, raw_text: &str) {
        self.dispatcher.handle_message(&self.conn, &self.sink_dyn, raw_text).await;
    }

    pub async fn send_json(&self, value: serde_json::Value) {
        self.send_raw(&value.to_string()).await;
    }

    pub fn close(&self, code: Option<u16>, reason: Option<&str>) {
        self.sink.set_ready_state(ReadyState::Closed);
        self.dispatcher.handle_close(&self.conn, code, reason);
    }
}
