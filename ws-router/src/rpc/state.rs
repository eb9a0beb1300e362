//! Per-correlation RPC state (spec §3 "RPC state", §4.6). The one-shot guard
//! and cancel-once guarantee both live here so they're local and auditable
//! (design notes §9).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub type CancelCallback = Box<dyn FnOnce() + Send>;

/// `(clientId, correlationId)` keyed state. Invariants (spec §3):
/// - `replied` is monotone false -> true.
/// - once true, reply/progress/error are no-ops.
/// - cancel callbacks fire at most once per correlation per disconnect.
pub struct RpcState {
    pub client_id: String,
    pub correlation_id: String,
    pub response_message_type: String,
    pub received_at: Instant,
    pub deadline: Instant,
    pub idle_deadline: Instant,
    replied: AtomicBool,
    last_progress_at: Mutex<Instant>,
    /// `None` once cancel has fired (or state is otherwise terminal) — the
    /// `take()` in `fire_cancel` is what makes cancellation at-most-once.
    cancel_callbacks: Mutex<Option<Vec<CancelCallback>>>,
}

impl RpcState {
    pub fn new(
        client_id: String,
        correlation_id: String,
        response_message_type: String,
        received_at: Instant,
        timeout_ms: u64,
        idle_timeout_ms: u64,
    ) -> Self {
        // leading-edge only: the very first `progress` call must always be
        // allowed, regardless of throttleMs, so seed this far in the past.
        let never = received_at
            .checked_sub(Duration::from_secs(3600))
            .unwrap_or(received_at);

        Self {
            client_id,
            correlation_id,
            response_message_type,
            received_at,
            deadline: received_at + Duration::from_millis(timeout_ms),
            idle_deadline: received_at + Duration::from_millis(idle_timeout_ms),
            replied: AtomicBool::new(false),
            last_progress_at: Mutex::new(never),
            cancel_callbacks: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn is_replied(&self) -> bool {
        self.replied.load(Ordering::SeqCst)
    }

    /// Attempts to claim the single terminal send. Returns `true` exactly
    /// once per state, for the first caller.
    pub fn try_terminate(&self) -> bool {
        self.replied
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Leading-edge progress throttle (spec §4.6). Returns `true` if this
    /// progress update should be sent.
    pub fn should_emit_progress(&self, throttle: Duration) -> bool {
        if self.is_replied() {
            return false;
        }

        let now = Instant::now();
        let mut last = self.last_progress_at.lock();

        if now.saturating_duration_since(*last) >= throttle {
            *last = now;
            true
        } else {
            false
        }
    }

    pub fn on_cancel(&self, callback: CancelCallback) {
        let mut callbacks = self.cancel_callbacks.lock();
        if let Some(callbacks) = callbacks.as_mut() {
            callbacks.push(callback);
        }
        // if cancel already fired, the callback is dropped without running —
        // there is nothing left to cancel.
    }

    /// Fires every registered cancel callback exactly once, in registration
    /// order. Safe to call more than once; only the first call does
    /// anything. Callback panics are isolated from each other.
    pub fn fire_cancel(&self) {
        let callbacks = self.cancel_callbacks.lock().take();

        if let Some(callbacks) = callbacks {
            for callback in callbacks {
                if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
                    tracing::error!(
                        client_id = %self.client_id,
                        correlation_id = %self.correlation_id,
                        ?panic,
                        "onCancel callback panicked"
                    );
                }
            }
        }
    }

    pub fn time_remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline || now >= self.idle_deadline
    }
}
