//! The lifecycle state machine and the per-frame pipeline (spec §4.4).
//! Ties together the registry, validator, connection registry, RPC engine,
//! and middleware chain into the nine-step message pipeline.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{instrument, warn};

use crate::connection::{ConnectionData, ConnectionRegistry};
use crate::context::Context;
use crate::envelope::{
    extract_correlation_id, extract_timeout_ms, is_control_type, strip_reserved_meta, OutEnvelope,
    RawEnvelope, CONTROL_ABORT,
};
use crate::error::{ErrorCode, WsRouterError, WsRouterResult};
use crate::middleware::{Middleware, MiddlewareChain};
use crate::registry::{MessageDescriptor, MessageRegistry};
use crate::rpc::{build_rpc_error_envelope, RpcConfig, RpcEngine, RpcHandle};
use crate::transport::{ConnectionSink, OutboundData};
use crate::validator::ValidatorAdapter;
use crate::config::RouterConfig;

pub type HandlerFuture = Pin<Box<dyn Future<Output = WsRouterResult<()>> + Send>>;
pub type HandlerFn = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&WsRouterError) + Send + Sync>;

/// Owns the message catalog, the validator, the connection registry, the
/// RPC engine, and the middleware chain. One instance per process; the
/// "lifecycle state machine per connection" (spec §4.4) is expressed as the
/// sequence of `handle_open`/`handle_message`/`handle_close` calls a
/// transport adapter makes per connection, not as a distinct object.
pub struct Dispatcher<V: ValidatorAdapter> {
    registry: MessageRegistry<V::Schema>,
    validator: Arc<V>,
    handlers: DashMap<String, HandlerFn>,
    connections: Arc<ConnectionRegistry>,
    rpc_engine: Arc<RpcEngine>,
    middleware: RwLock<MiddlewareChain>,
    config: RouterConfig,
    error_hook: RwLock<Option<ErrorHook>>,
}

impl<V: ValidatorAdapter + 'static> Dispatcher<V> {
    pub fn new(validator: Arc<V>, config: RouterConfig) -> Arc<Self> {
        let rpc_engine = RpcEngine::new(RpcConfig {
            default_timeout_ms: config.rpc_timeout_ms,
            idle_timeout_extra_ms: config.rpc_idle_timeout_extra_ms,
            max_inflight_per_socket: config.max_inflight_rpcs_per_socket,
            socket_buffer_limit_bytes: config.socket_buffer_limit_bytes,
            sweep_interval_ms: config.rpc_sweep_interval_ms,
        });

        Arc::new(Self {
            registry: MessageRegistry::new(),
            validator,
            handlers: DashMap::new(),
            connections: Arc::new(ConnectionRegistry::new()),
            rpc_engine,
            middleware: RwLock::new(MiddlewareChain::new()),
            config,
            error_hook: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn rpc_engine(&self) -> &Arc<RpcEngine> {
        &self.rpc_engine
    }

    pub fn registry(&self) -> &MessageRegistry<V::Schema> {
        &self.registry
    }

    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.write().push(middleware);
    }

    /// Surfaced for parse failures, unsupported types, validation failures,
    /// and handler exceptions (spec §7 "Propagation policy").
    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&WsRouterError) + Send + Sync + 'static,
    {
        *self.error_hook.write() = Some(Arc::new(hook));
    }

    pub fn register_event<H, Fut>(&self, message_type: impl Into<String>, schema: V::Schema, handler: H) -> WsRouterResult<()>
    where
        H: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WsRouterResult<()>> + Send + 'static,
    {
        let message_type = message_type.into();
        self.registry.register(MessageDescriptor::event(message_type.clone(), schema))?;
        self.handlers.insert(message_type, Arc::new(move |ctx| Box::pin(handler(ctx))));
        Ok(())
    }

    pub fn register_rpc<H, Fut>(
        &self,
        message_type: impl Into<String>,
        request_schema: V::Schema,
        response_message_type: impl Into<String>,
        response_schema: V::Schema,
        handler: H,
    ) -> WsRouterResult<()>
    where
        H: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WsRouterResult<()>> + Send + 'static,
    {
        let message_type = message_type.into();
        self.registry.register(MessageDescriptor::rpc(
            message_type.clone(),
            request_schema,
            response_message_type,
            response_schema,
        ))?;
        self.handlers.insert(message_type, Arc::new(move |ctx| Box::pin(handler(ctx))));
        Ok(())
    }

    /// Runs open-lifecycle callbacks and registers the send function (spec
    /// §4.4 "On open").
    pub fn handle_open(&self, conn: &ConnectionData, sink: Arc<dyn ConnectionSink>) {
        self.connections.open(conn, sink);
    }

    /// Cancels every inflight RPC, runs close-lifecycle callbacks, and
    /// removes the send function (spec §4.4 "On close" steps 1, 2, 4). Topic
    /// teardown (step 3) is the pub/sub plugin's responsibility — it hooks
    /// this same close path via `ConnectionRegistry::on_close_hook`.
    pub fn handle_close(&self, conn: &ConnectionData, code: Option<u16>, reason: Option<&str>) {
        self.rpc_engine.cancel_all_for_socket(&conn.client_id);
        self.connections.close(conn, code, reason);
    }

    /// The nine-step inbound pipeline (spec §4.4 "On message").
    #[instrument(skip_all, fields(client_id = %conn.client_id))]
    pub async fn handle_message(&self, conn: &ConnectionData, sink: &Arc<dyn ConnectionSink>, raw_text: &str) {
        let raw: RawEnvelope = match serde_json::from_str(raw_text) {
            Ok(raw) => raw,
            Err(err) => {
                self.emit_error(&WsRouterError::InvalidMessageFormat(err.to_string().into()));
                return;
            }
        };

        if is_control_type(&raw.message_type) {
            self.handle_control(conn, &raw);
            return;
        }

        let descriptor = match self.registry.lookup(&raw.message_type) {
            Some(descriptor) => descriptor,
            None => {
                self.emit_error(&WsRouterError::UnsupportedMessageType(raw.message_type.clone().into()));
                return;
            }
        };

        let outcome = self.validator.validate(&descriptor, &raw).await;
        if !outcome.ok {
            let err = WsRouterError::ValidationFailed(outcome.issues);
            self.emit_error(&err);

            if descriptor.is_rpc() {
                match extract_correlation_id(&raw.meta) {
                    Some(correlation_id) => {
                        let env = build_rpc_error_envelope(&correlation_id, &err.as_wire_error());
                        self.send_envelope(sink, env);
                    }
                    None => self.send_error_envelope(sink, &err),
                }
            } else {
                self.send_error_envelope(sink, &err);
            }
            return;
        }

        let mut meta = raw.meta;
        strip_reserved_meta(&mut meta);
        let payload = outcome.value;

        if descriptor.is_rpc() {
            let correlation_id = match extract_correlation_id(&meta) {
                Some(id) => id,
                None => {
                    let err = WsRouterError::InvalidMessageFormat("rpc message missing meta.correlationId".into());
                    self.emit_error(&err);
                    self.send_error_envelope(sink, &err);
                    return;
                }
            };

            let response_message_type = descriptor
                .response_message_type
                .clone()
                .expect("rpc descriptor always carries a response type");
            let timeout_ms = extract_timeout_ms(&meta);

            let state = match self
                .rpc_engine
                .register(&conn.client_id, &correlation_id, &response_message_type, timeout_ms)
            {
                Ok(state) => state,
                Err(err) => {
                    self.emit_error(&err);
                    let env = build_rpc_error_envelope(&correlation_id, &err.as_wire_error());
                    self.send_envelope(sink, env);
                    return;
                }
            };

            let rpc_handle = RpcHandle::new(state, self.rpc_engine.clone(), sink.clone());
            let ctx = Context::new_rpc(raw.message_type.clone(), payload, meta, conn.clone(), sink.clone(), rpc_handle);
            self.run_pipeline(&raw.message_type, ctx, sink).await;
        } else {
            let ctx = Context::new_event(raw.message_type.clone(), payload, meta, conn.clone(), sink.clone());
            self.run_pipeline(&raw.message_type, ctx, sink).await;
        }
    }

    fn handle_control(&self, conn: &ConnectionData, raw: &RawEnvelope) {
        if raw.message_type == CONTROL_ABORT {
            if let Some(correlation_id) = extract_correlation_id(&raw.meta) {
                self.rpc_engine.cancel(&conn.client_id, &correlation_id);
            }
        }
        // Other/unknown control types are silently ignored (spec §4.4 step 2).
    }

    /// Steps 7–9: middleware chain, then the handler, with terminal-error
    /// routing on either a middleware rejection or a handler exception.
    async fn run_pipeline(&self, message_type: &str, mut ctx: Context, sink: &Arc<dyn ConnectionSink>) {
        let middlewares = self.middleware.read().snapshot();
        for middleware in &middlewares {
            if let Err(err) = middleware.handle(&mut ctx).await {
                self.emit_error(&err);
                self.terminate(&ctx, sink, err);
                return;
            }
        }

        let handler = match self.handlers.get(message_type) {
            Some(handler) => handler.value().clone(),
            None => {
                warn!(%message_type, "descriptor registered without a handler");
                return;
            }
        };

        let rpc_probe = ctx.rpc_handle();
        if let Err(err) = handler(ctx).await {
            self.emit_error(&err);
            match rpc_probe {
                Some(handle) => {
                    handle.error(ErrorCode::InternalServerError, "internal server error", None);
                }
                None => self.send_error_envelope(sink, &err),
            }
        }
    }

    fn terminate(&self, ctx: &Context, sink: &Arc<dyn ConnectionSink>, err: WsRouterError) {
        match ctx.rpc_handle() {
            Some(handle) => {
                let wire = err.as_wire_error();
                handle.error(wire.code, wire.message, wire.details);
            }
            None => self.send_error_envelope(sink, &err),
        }
    }

    fn emit_error(&self, err: &WsRouterError) {
        if let Some(hook) = self.error_hook.read().as_ref() {
            hook(err);
        }
    }

    fn send_error_envelope(&self, sink: &Arc<dyn ConnectionSink>, err: &WsRouterError) {
        let wire = err.as_wire_error();
        let env = match serde_json::to_value(&wire) {
            Ok(payload) => OutEnvelope::new("ERROR").with_payload(payload),
            Err(e) => {
                warn!(?e, "failed to serialize error payload");
                return;
            }
        };
        self.send_envelope(sink, env);
    }

    fn send_envelope(&self, sink: &Arc<dyn ConnectionSink>, env: OutEnvelope) {
        match env.to_json_string() {
            Ok(text) => sink.send(OutboundData::text(text)),
            Err(e) => warn!(?e, "failed to serialize outbound envelope"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReadyState;
    use crate::validator::{FieldKind, JsonMessageSchema, ObjectSchema, StrictJsonValidator};
    use parking_lot::Mutex;
    use serde_json::json;

    struct RecordingSink(Mutex<Vec<String>>);
    impl ConnectionSink for RecordingSink {
        fn send(&self, data: OutboundData) {
            if let OutboundData::Text(t) = data {
                self.0.lock().push(t);
            }
        }
        fn close(&self, _code: Option<u16>, _reason: Option<String>) {}
        fn ready_state(&self) -> ReadyState {
            ReadyState::Open
        }
    }

    fn ping_pong_dispatcher() -> (Arc<Dispatcher<StrictJsonValidator>>, Arc<RecordingSink>) {
        let dispatcher = Dispatcher::new(Arc::new(StrictJsonValidator), RouterConfig::default());
        dispatcher
            .register_event(
                "PING",
                JsonMessageSchema::new("PING", ObjectSchema::default().field("text", FieldKind::String { min_len: None }, true)),
                |ctx| async move {
                    let text = ctx.payload.as_ref().and_then(|p| p["text"].as_str()).unwrap_or_default().to_string();
                    ctx.send("PONG", Some(json!({ "text": text, "timestamp": 1 })), Default::default());
                    Ok(())
                },
            )
            .unwrap();

        let sink = Arc::new(RecordingSink(Mutex::new(vec![])));
        (dispatcher, sink)
    }

    #[tokio::test]
    async fn e1_echo() {
        let (dispatcher, sink) = ping_pong_dispatcher();
        let conn = ConnectionData::new("c1");
        let sink_dyn: Arc<dyn ConnectionSink> = sink.clone();

        dispatcher
            .handle_message(&conn, &sink_dyn, r#"{"type":"PING","meta":{},"payload":{"text":"hi"}}"#)
            .await;

        let sent = sink.0.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("\"type\":\"PONG\""));
        assert!(sent[0].contains("\"text\":\"hi\""));
    }

    #[tokio::test]
    async fn unknown_type_does_not_close_socket_and_emits_error() {
        let (dispatcher, sink) = ping_pong_dispatcher();
        let conn = ConnectionData::new("c1");
        let sink_dyn: Arc<dyn ConnectionSink> = sink.clone();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors2 = errors.clone();
        dispatcher.on_error(move |err| errors2.lock().push(format!("{}", err)));

        dispatcher
            .handle_message(&conn, &sink_dyn, r#"{"type":"NOPE","meta":{},"payload":{}}"#)
            .await;

        assert_eq!(errors.lock().len(), 1);
        assert!(sink.0.lock().is_empty());
    }

    #[tokio::test]
    async fn malformed_json_does_not_close_socket() {
        let (dispatcher, sink) = ping_pong_dispatcher();
        let conn = ConnectionData::new("c1");
        let sink_dyn: Arc<dyn ConnectionSink> = sink.clone();

        dispatcher.handle_message(&conn, &sink_dyn, "not json").await;

        assert!(sink.0.lock().is_empty());
        assert!(dispatcher.connections().is_empty());
    }

    #[tokio::test]
    async fn e2_rpc_success_with_progress() {
        let dispatcher = Dispatcher::new(Arc::new(StrictJsonValidator), RouterConfig::default());
        dispatcher
            .register_rpc(
                "GET_USER",
                JsonMessageSchema::new("GET_USER", ObjectSchema::default().field("id", FieldKind::String { min_len: None }, true)),
                "USER",
                JsonMessageSchema::new("USER", ObjectSchema::default()),
                |ctx| async move {
                    ctx.progress(json!({ "step": 1 }), std::time::Duration::from_millis(0));
                    ctx.progress(json!({ "step": 2 }), std::time::Duration::from_millis(0));
                    ctx.reply(json!({ "id": "u", "name": "Alice" }));
                    Ok(())
                },
            )
            .unwrap();

        let conn = ConnectionData::new("c1");
        let sink = Arc::new(RecordingSink(Mutex::new(vec![])));
        let sink_dyn: Arc<dyn ConnectionSink> = sink.clone();

        dispatcher
            .handle_message(
                &conn,
                &sink_dyn,
                r#"{"type":"GET_USER","meta":{"correlationId":"r1"},"payload":{"id":"u"}}"#,
            )
            .await;

        let sent = sink.0.lock();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].contains("$ws:rpc-progress"));
        assert!(sent[1].contains("$ws:rpc-progress"));
        assert!(sent[2].contains("\"type\":\"USER\""));
        for frame in sent.iter() {
            assert!(frame.contains("\"correlationId\":\"r1\""));
        }
    }

    #[tokio::test]
    async fn e3_double_reply_then_error_keeps_first_terminal_only() {
        let dispatcher = Dispatcher::new(Arc::new(StrictJsonValidator), RouterConfig::default());
        dispatcher
            .register_rpc(
                "GET_USER",
                JsonMessageSchema::no_payload("GET_USER"),
                "USER",
                JsonMessageSchema::no_payload("USER"),
                |ctx| async move {
                    ctx.reply(json!({ "name": "A" }));
                    ctx.reply(json!({ "name": "B" }));
                    ctx.error(ErrorCode::InternalServerError, "X", None);
                    Ok(())
                },
            )
            .unwrap();

        let conn = ConnectionData::new("c1");
        let sink = Arc::new(RecordingSink(Mutex::new(vec![])));
        let sink_dyn: Arc<dyn ConnectionSink> = sink.clone();

        dispatcher
            .handle_message(&conn, &sink_dyn, r#"{"type":"GET_USER","meta":{"correlationId":"r1"}}"#)
            .await;

        let sent = sink.0.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("\"name\":\"A\""));
        assert!(!sent[0].contains("rpc-error"));
    }

    #[tokio::test]
    async fn e4_validation_failure_rpc_keeps_socket_open() {
        let dispatcher = Dispatcher::new(Arc::new(StrictJsonValidator), RouterConfig::default());
        dispatcher
            .register_rpc(
                "SET_NAME",
                JsonMessageSchema::new("SET_NAME", ObjectSchema::default().field("name", FieldKind::String { min_len: Some(1) }, true)),
                "ACK",
                JsonMessageSchema::no_payload("ACK"),
                |ctx| async move {
                    ctx.reply(json!({}));
                    Ok(())
                },
            )
            .unwrap();

        let conn = ConnectionData::new("c1");
        let sink = Arc::new(RecordingSink(Mutex::new(vec![])));
        let sink_dyn: Arc<dyn ConnectionSink> = sink.clone();

        dispatcher
            .handle_message(
                &conn,
                &sink_dyn,
                r#"{"type":"SET_NAME","meta":{"correlationId":"r1"},"payload":{"name":""}}"#,
            )
            .await;

        {
            let sent = sink.0.lock();
            assert_eq!(sent.len(), 1);
            assert!(sent[0].contains("$ws:rpc-error"));
        }

        dispatcher
            .handle_message(
                &conn,
                &sink_dyn,
                r#"{"type":"SET_NAME","meta":{"correlationId":"r2"},"payload":{"name":"ok"}}"#,
            )
            .await;

        let sent = sink.0.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains("\"type\":\"ACK\""));
    }

    #[tokio::test]
    async fn abort_cancels_inflight_rpc() {
        let dispatcher = Dispatcher::new(Arc::new(StrictJsonValidator), RouterConfig::default());
        let canceled = Arc::new(Mutex::new(false));
        let canceled2 = canceled.clone();

        dispatcher
            .register_rpc(
                "LONG_OP",
                JsonMessageSchema::no_payload("LONG_OP"),
                "RESULT",
                JsonMessageSchema::no_payload("RESULT"),
                move |ctx| {
                    let canceled = canceled2.clone();
                    async move {
                        ctx.on_cancel(Box::new(move || *canceled.lock() = true));
                        Ok(())
                    }
                },
            )
            .unwrap();

        let conn = ConnectionData::new("c1");
        let sink = Arc::new(RecordingSink(Mutex::new(vec![])));
        let sink_dyn: Arc<dyn ConnectionSink> = sink.clone();

        dispatcher
            .handle_message(&conn, &sink_dyn, r#"{"type":"LONG_OP","meta":{"correlationId":"r1"}}"#)
            .await;
        dispatcher
            .handle_message(&conn, &sink_dyn, r#"{"type":"$ws:abort","meta":{"correlationId":"r1"}}"#)
            .await;

        assert!(*canceled.lock());
        assert!(dispatcher.rpc_engine().get("c1", "r1").is_none());
    }
}
