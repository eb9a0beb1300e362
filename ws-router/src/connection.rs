//! Connection registry (spec §4.4 "open"/"close", design notes §9 "global
//! mutable state"). Maps `clientId -> send handle` and runs isolated
//! lifecycle callbacks. Grows/shrinks atomically at open/close — the only
//! other process-wide mutable state besides the (immutable-after-start)
//! registry and the pub/sub subscriber index.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::error;
use ulid::Ulid;

use crate::transport::ConnectionSink;

/// Shared, mutable `ctx.data` (spec §3 "Connection data" `...user fields`).
/// Cloning a [`ConnectionData`] clones this handle, not the map — every
/// context built for the same connection sees the same fields, safely under
/// concurrent handlers (spec §5: messages on one socket may execute
/// concurrently).
pub type SharedFields = Arc<Mutex<Map<String, Value>>>;

/// Per-connection application state (spec §3 "Connection data"). The engine
/// never exposes the raw transport object beyond `ws` (a [`ConnectionSink`]);
/// everything else lives here.
#[derive(Debug, Clone)]
pub struct ConnectionData {
    pub client_id: String,
    pub connected_at_ms: i64,
    pub fields: SharedFields,
}

impl ConnectionData {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            connected_at_ms: now_ms(),
            fields: Arc::new(Mutex::new(Map::new())),
        }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Stable, time-ordered client id, assigned before `open` fires (spec §4.3).
pub fn generate_client_id() -> String {
    Ulid::new().to_string()
}

type OpenHook = Box<dyn Fn(&ConnectionData) + Send + Sync>;
type CloseHook = Box<dyn Fn(&ConnectionData, Option<u16>, Option<&str>) + Send + Sync>;

#[derive(Default)]
pub struct ConnectionRegistry {
    sinks: DashMap<String, Arc<dyn ConnectionSink>>,
    open_hooks: RwLock<Vec<OpenHook>>,
    close_hooks: RwLock<Vec<CloseHook>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open_hook(&self, hook: OpenHook) {
        self.open_hooks.write().push(hook);
    }

    pub fn on_close_hook(&self, hook: CloseHook) {
        self.close_hooks.write().push(hook);
    }

    /// Runs every open-lifecycle callback, isolated from each other, then
    /// registers the socket's send function under `clientId` (spec §4.4).
    pub fn open(&self, conn: &ConnectionData, sink: Arc<dyn ConnectionSink>) {
        for hook in self.open_hooks.read().iter() {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| hook(conn))) {
                error!(client_id = %conn.client_id, ?panic, "open lifecycle hook panicked");
            }
        }

        self.sinks.insert(conn.client_id.clone(), sink);
    }

    /// Runs every close-lifecycle callback, isolated, then removes the send
    /// function (spec §4.4 "On close" step 1 and step 4).
    pub fn close(&self, conn: &ConnectionData, code: Option<u16>, reason: Option<&str>) {
        for hook in self.close_hooks.read().iter() {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| hook(conn, code, reason))) {
                error!(client_id = %conn.client_id, ?panic, "close lifecycle hook panicked");
            }
        }

        self.sinks.remove(&conn.client_id);
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<dyn ConnectionSink>> {
        self.sinks.get(client_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}
