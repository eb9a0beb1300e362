//! Reference transport adapter (spec §4.3, §1 "no concrete transport runtime
//! beyond axum"). Grounded on anvil's `ws.rs`: a `WebSocketUpgrade` handler
//! that hands the socket to a per-connection loop, `on_upgrade` as the single
//! entrypoint. Unlike anvil's RPC-only loop this bridges every frame through
//! the full dispatcher pipeline and keeps a writer task so `ConnectionSink`'s
//! `send` can stay synchronous.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::WebSocketUpgrade;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::connection::{generate_client_id, ConnectionData};
use crate::dispatcher::Dispatcher;
use crate::transport::{ConnectionSink, OutboundData, ReadyState};
use crate::validator::ValidatorAdapter;

/// `ConnectionSink` backed by an unbounded channel into a writer task that
/// owns the actual socket half — keeps `send` a non-blocking enqueue (spec
/// §4.3 "synchronous enqueue") even though the underlying axum sink is
/// `async`.
struct AxumConnectionSink {
    tx: mpsc::UnboundedSender<OutboundData>,
    ready_state: Arc<RwLock<ReadyState>>,
}

impl ConnectionSink for AxumConnectionSink {
    fn send(&self, data: OutboundData) {
        if self.tx.send(data).is_err() {
            trace!("send on a closed axum connection sink dropped");
        }
    }

    fn close(&self, _code: Option<u16>, _reason: Option<String>) {
        *self.ready_state.write() = ReadyState::Closing;
        // Dropping the sender side would race the writer task's own queue
        // drain; closing is instead driven by the writer task observing
        // channel closure once `Arc<AxumConnectionSink>` is dropped by the
        // connection registry on `handle_close`.
    }

    fn ready_state(&self) -> ReadyState {
        *self.ready_state.read()
    }
}

/// Entrypoint invoked by an axum route: `Router::new().route("/ws", get(handle_upgrade::<V>))`.
pub async fn handle_upgrade<V>(
    ws: WebSocketUpgrade,
    dispatcher: Arc<Dispatcher<V>>,
) -> impl IntoResponse
where
    V: ValidatorAdapter + 'static,
{
    ws.on_upgrade(move |socket| handle_socket(socket, dispatcher))
}

async fn handle_socket<V>(socket: WebSocket, dispatcher: Arc<Dispatcher<V>>)
where
    V: ValidatorAdapter + 'static,
{
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundData>();
    let ready_state = Arc::new(RwLock::new(ReadyState::Open));

    let sink: Arc<dyn ConnectionSink> = Arc::new(AxumConnectionSink {
        tx,
        ready_state: ready_state.clone(),
    });

    let client_id = generate_client_id();
    let conn = ConnectionData::new(client_id.clone());

    let writer = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            let msg = match data {
                OutboundData::Text(t) => Message::Text(t),
                OutboundData::Binary(b) => Message::Binary(b),
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    dispatcher.handle_open(&conn, sink.clone());

    let mut close_code: Option<u16> = None;
    let mut close_reason: Option<String> = None;

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                dispatcher.handle_message(&conn, &sink, &text).await;
            }
            Ok(Message::Binary(_)) => {
                warn!(client_id = %client_id, "unexpected binary frame, ignoring");
            }
            Ok(Message::Close(frame)) => {
                close_code = frame.as_ref().map(|f| f.code);
                close_reason = frame.map(|f| f.reason.to_string());
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                trace!(client_id = %client_id, ?err, "websocket read error, closing");
                break;
            }
        }
    }

    *ready_state.write() = ReadyState::Closed;
    dispatcher.handle_close(&conn, close_code, close_reason.as_deref());
    writer.abort();
}
