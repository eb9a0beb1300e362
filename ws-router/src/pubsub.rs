//! Pub/Sub adapter composition and local fan-out (spec §4.8). The adapter is
//! split into a `PubSubDriver` (local subscription index + publish) and an
//! optional `BrokerConsumer`; `Router::pubsub` drives publish through
//! whichever is configured and owns plugin-lifecycle idempotency.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{instrument, warn};

use crate::connection::ConnectionRegistry;
use crate::envelope::OutEnvelope;
use crate::transport::OutboundData;

pub const EXCLUDE_CLIENT_ID_META_KEY: &str = "excludeClientId";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishCapability {
    Exact,
    Approximate,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub ok: bool,
    pub capability: PublishCapability,
    pub matched: Option<u64>,
    pub error: Option<String>,
}

impl PublishOutcome {
    pub fn ok(capability: PublishCapability, matched: Option<u64>) -> Self {
        Self {
            ok: true,
            capability,
            matched,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishEnvelope {
    pub topic: String,
    pub message_type: String,
    pub payload: Option<Value>,
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub exclude_self: bool,
    pub sender_client_id: Option<String>,
}

/// A "remote delivery arrived" callback handed to a [`BrokerConsumer`]. The
/// broker calls this for every message it receives from elsewhere; the
/// plugin fans it out locally exactly like `PubSubDriver::get_subscribers`
/// would for a same-process publish.
pub type DeliverLocally = Arc<dyn Fn(PublishEnvelope) + Send + Sync>;

/// Local subscription index + publish (spec §4.8 "Subscription state").
#[async_trait]
pub trait PubSubDriver: Send + Sync {
    async fn subscribe(&self, client_id: &str, topic: &str) -> anyhow::Result<()>;

    async fn unsubscribe(&self, client_id: &str, topic: &str) -> anyhow::Result<()>;

    async fn publish(&self, envelope: &PublishEnvelope, opts: &PublishOptions) -> PublishOutcome;

    /// Local subscribers of `topic`, for local fan-out when no broker is
    /// configured.
    async fn get_subscribers(&self, topic: &str) -> Vec<String>;

    async fn list_topics(&self) -> Vec<String> {
        Vec::new()
    }

    async fn has_topic(&self, _topic: &str) -> bool {
        false
    }
}

/// Drives remote delivery for a broker-backed adapter (spec §4.8
/// "composition"). `start` returns a stop function; calling it more than
/// once must be safe.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    async fn start(&self, deliver_locally: DeliverLocally) -> anyhow::Result<Box<dyn FnOnce() + Send>>;
}

/// Sequentially starts multiple brokers; on any failure, already-started
/// consumers are stopped in reverse order before the error propagates. The
/// combined stop function is itself idempotent.
pub async fn combine_brokers(
    brokers: Vec<Arc<dyn BrokerConsumer>>,
    deliver_locally: DeliverLocally,
) -> anyhow::Result<Box<dyn FnOnce() + Send>> {
    let mut stops: Vec<Box<dyn FnOnce() + Send>> = Vec::with_capacity(brokers.len());

    for broker in &brokers {
        match broker.start(deliver_locally.clone()).await {
            Ok(stop) => stops.push(stop),
            Err(err) => {
                for stop in stops.into_iter().rev() {
                    stop();
                }
                return Err(err);
            }
        }
    }

    Ok(Box::new(move || {
        for stop in stops.into_iter().rev() {
            stop();
        }
    }))
}

/// `router.pubsub` (spec §4.8 "Plugin lifecycle"). Owns an optional broker
/// and drives either local fan-out or broker-mediated delivery.
pub struct PubSubPlugin {
    driver: Arc<dyn PubSubDriver>,
    broker: Option<Arc<dyn BrokerConsumer>>,
    connections: Arc<ConnectionRegistry>,
    stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl PubSubPlugin {
    pub fn new(
        driver: Arc<dyn PubSubDriver>,
        broker: Option<Arc<dyn BrokerConsumer>>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            driver,
            broker,
            connections,
            stop: Mutex::new(None),
        }
    }

    /// Idempotent: calling `init` a second time is a no-op (spec §4.8).
    pub async fn init(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.stop.lock().is_some() {
            return Ok(());
        }

        let Some(broker) = self.broker.clone() else {
            self.stop.lock().replace(Box::new(|| {}));
            return Ok(());
        };

        let this = self.clone();
        let deliver: DeliverLocally = Arc::new(move |envelope| {
            this.fan_out_local(envelope, None);
        });

        let stop = broker.start(deliver).await?;
        self.stop.lock().replace(stop);
        Ok(())
    }

    /// Idempotent: safe to call repeatedly, including before `init`.
    pub async fn shutdown(&self) {
        if let Some(stop) = self.stop.lock().take() {
            stop();
        }
    }

    #[instrument(skip_all, fields(topic = %envelope.topic))]
    pub async fn publish(&self, mut envelope: PublishEnvelope, opts: PublishOptions) -> PublishOutcome {
        if opts.exclude_self {
            if let Some(sender) = &opts.sender_client_id {
                envelope
                    .meta
                    .insert(EXCLUDE_CLIENT_ID_META_KEY.to_string(), Value::String(sender.clone()));
            }
        }

        let outcome = self.driver.publish(&envelope, &opts).await;

        if self.broker.is_none() {
            let exclude = envelope
                .meta
                .get(EXCLUDE_CLIENT_ID_META_KEY)
                .and_then(Value::as_str)
                .map(str::to_string);
            self.fan_out_local(envelope, exclude);
        }

        outcome
    }

    /// Strips `excludeClientId` from the outbound wire frame and sends to
    /// every local subscriber except the excluded one. Send failures are
    /// logged, never propagated (spec §4.8 step 3).
    fn fan_out_local(&self, mut envelope: PublishEnvelope, exclude: Option<String>) {
        let exclude = exclude.or_else(|| {
            envelope
                .meta
                .remove(EXCLUDE_CLIENT_ID_META_KEY)
                .and_then(|v| v.as_str().map(str::to_string))
        });
        envelope.meta.remove(EXCLUDE_CLIENT_ID_META_KEY);

        let driver = self.driver.clone();
        let connections = self.connections.clone();
        let topic = envelope.topic.clone();
        let message_type = envelope.message_type.clone();
        let payload = envelope.payload.clone();
        let meta = envelope.meta.clone();

        tokio::spawn(async move {
            for client_id in driver.get_subscribers(&topic).await {
                if Some(&client_id) == exclude.as_ref() {
                    continue;
                }

                let Some(sink) = connections.get(&client_id) else {
                    continue;
                };

                let mut out = OutEnvelope::new(message_type.clone());
                out.meta = meta.clone();
                if let Some(payload) = payload.clone() {
                    out = out.with_payload(payload);
                }

                match out.to_json_string() {
                    Ok(text) => sink.send(OutboundData::text(text)),
                    Err(err) => warn!(%client_id, ?err, "failed to serialize publish envelope"),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionData;
    use crate::transport::{ConnectionSink, ReadyState};
    use dashmap::DashMap;
    use parking_lot::RwLock as PRwLock;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink(PRwLock<Vec<String>>);
    impl ConnectionSink for RecordingSink {
        fn send(&self, data: OutboundData) {
            if let OutboundData::Text(t) = data {
                self.0.write().push(t);
            }
        }
        fn close(&self, _code: Option<u16>, _reason: Option<String>) {}
        fn ready_state(&self) -> ReadyState {
            ReadyState::Open
        }
    }

    struct InMemoryDriver {
        subs: DashMap<String, HashSet<String>>,
    }

    impl InMemoryDriver {
        fn new() -> Self {
            Self { subs: DashMap::new() }
        }
    }

    #[async_trait]
    impl PubSubDriver for InMemoryDriver {
        async fn subscribe(&self, client_id: &str, topic: &str) -> anyhow::Result<()> {
            self.subs.entry(topic.to_string()).or_default().insert(client_id.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, client_id: &str, topic: &str) -> anyhow::Result<()> {
            if let Some(mut set) = self.subs.get_mut(topic) {
                set.remove(client_id);
            }
            Ok(())
        }

        async fn publish(&self, _envelope: &PublishEnvelope, _opts: &PublishOptions) -> PublishOutcome {
            PublishOutcome::ok(PublishCapability::Exact, None)
        }

        async fn get_subscribers(&self, topic: &str) -> Vec<String> {
            self.subs.get(topic).map(|s| s.iter().cloned().collect()).unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn local_fanout_excludes_the_sender() {
        let driver = Arc::new(InMemoryDriver::new());
        driver.subscribe("sender", "room").await.unwrap();
        driver.subscribe("other", "room").await.unwrap();

        let connections = Arc::new(ConnectionRegistry::new());
        let sender_sink = Arc::new(RecordingSink(PRwLock::new(vec![])));
        let other_sink = Arc::new(RecordingSink(PRwLock::new(vec![])));
        connections.open(&ConnectionData::new("sender"), sender_sink.clone());
        connections.open(&ConnectionData::new("other"), other_sink.clone());

        let plugin = Arc::new(PubSubPlugin::new(driver, None, connections));
        plugin.init().await.unwrap();

        plugin
            .publish(
                PublishEnvelope {
                    topic: "room".into(),
                    message_type: "CHAT".into(),
                    payload: Some(serde_json::json!({"text": "hi"})),
                    meta: Map::new(),
                },
                PublishOptions {
                    exclude_self: true,
                    sender_client_id: Some("sender".to_string()),
                },
            )
            .await;

        // fan-out is spawned onto the runtime; yield until it runs.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(sender_sink.0.read().is_empty());
        assert_eq!(other_sink.0.read().len(), 1);
        assert!(!other_sink.0.read()[0].contains("excludeClientId"));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let driver = Arc::new(InMemoryDriver::new());
        let connections = Arc::new(ConnectionRegistry::new());
        let plugin = Arc::new(PubSubPlugin::new(driver, None, connections));

        plugin.init().await.unwrap();
        plugin.shutdown().await;
        plugin.shutdown().await;
    }

    #[tokio::test]
    async fn combine_brokers_rolls_back_on_partial_start_failure() {
        struct OkBroker(Arc<AtomicUsize>);
        #[async_trait]
        impl BrokerConsumer for OkBroker {
            async fn start(&self, _d: DeliverLocally) -> anyhow::Result<Box<dyn FnOnce() + Send>> {
                let stopped = self.0.clone();
                Ok(Box::new(move || {
                    stopped.fetch_add(1, Ordering::SeqCst);
                }))
            }
        }

        struct FailingBroker;
        #[async_trait]
        impl BrokerConsumer for FailingBroker {
            async fn start(&self, _d: DeliverLocally) -> anyhow::Result<Box<dyn FnOnce() + Send>> {
                anyhow::bail!("nope")
            }
        }

        let stopped = Arc::new(AtomicUsize::new(0));
        let brokers: Vec<Arc<dyn BrokerConsumer>> =
            vec![Arc::new(OkBroker(stopped.clone())), Arc::new(FailingBroker)];

        let deliver: DeliverLocally = Arc::new(|_| {});
        let err = combine_brokers(brokers, deliver).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
