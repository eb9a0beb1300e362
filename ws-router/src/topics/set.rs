//! Per-connection subscription set (spec §4.7). Every mutating op follows:
//! normalize, validate, await any in-flight op on the topic, re-check
//! idempotency, check limits/authorization, call the adapter, mutate local
//! state, release the in-flight lock. Confirmation level (`waitFor`/`verify`)
//! and cancellation (`signal`/`timeoutMs`) are threaded through via
//! [`TopicOpOptions`].

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

use crate::config::RouterConfig;
use crate::error::{WsRouterError, WsRouterResult};
use crate::messaging::SendSignal;
use crate::transport::{ConnectionSink, ReadyState};

use super::adapter::{TopicSocketAdapter, VerifyKind};

#[derive(Debug, Clone)]
pub struct TopicsConfig {
    pub max_topics: usize,
    pub pattern: Regex,
    pub max_length: usize,
}

impl TopicsConfig {
    pub fn from_router_config(config: &RouterConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            max_topics: config.max_topics_per_connection,
            pattern: config.compiled_topic_pattern()?,
            max_length: config.topic_max_length,
        })
    }
}

/// `{added, removed, total}` counters from a batch op (spec §4.7 "Batch").
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BatchReport {
    pub added: usize,
    pub removed: usize,
    pub total: usize,
}

/// `waitFor` (spec §4.7 "Confirmation levels"). `Optimistic` resolves as soon
/// as the adapter call that mutates remote state returns; `Settled`
/// additionally runs [`TopicSocketAdapter::verify`] per `verify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    Optimistic,
    Settled,
}

/// `verify` (spec §4.7 "Confirmation levels"), only consulted when `waitFor`
/// is `Settled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyLevel {
    /// A verify mismatch (or an adapter that can't verify at all) fails the
    /// op; for ops with a known inverse, local state is rolled back.
    Strict,
    /// A verify mismatch is logged and otherwise ignored.
    BestEffort,
    /// `verify` is never called.
    Off,
}

/// Options threaded through every mutating [`Topics`] op (spec §4.7
/// "Confirmation levels", "Cancellation").
#[derive(Debug, Clone)]
pub struct TopicOpOptions {
    pub wait_for: WaitFor,
    pub verify: VerifyLevel,
    pub timeout_ms: Option<u64>,
    pub signal: Option<SendSignal>,
}

impl Default for TopicOpOptions {
    fn default() -> Self {
        Self {
            wait_for: WaitFor::Optimistic,
            verify: VerifyLevel::Off,
            timeout_ms: None,
            signal: None,
        }
    }
}

/// `status(topic)` (spec §3 line 57): a precise state, distinct from the
/// optimistic boolean [`Topics::has`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopicStatus {
    Absent,
    PendingSubscribe,
    PendingUnsubscribe,
    Settled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Subscribe,
    Unsubscribe,
}

type Normalizer = Box<dyn Fn(&str) -> String + Send + Sync>;

fn check_signal(opts: &TopicOpOptions) -> WsRouterResult<()> {
    if let Some(signal) = &opts.signal {
        if signal.load(Ordering::SeqCst) {
            return Err(WsRouterError::FailedPrecondition("operation aborted via signal".into()));
        }
    }
    Ok(())
}

async fn with_timeout<T>(opts: &TopicOpOptions, fut: impl std::future::Future<Output = WsRouterResult<T>>) -> WsRouterResult<T> {
    match opts.timeout_ms {
        Some(ms) => tokio::time::timeout(std::time::Duration::from_millis(ms), fut)
            .await
            .unwrap_or_else(|_| Err(WsRouterError::AdapterError(anyhow::anyhow!("topic operation timed out")))),
        None => fut.await,
    }
}

fn rollback_error(err: WsRouterError, rollback_failed: Vec<String>) -> WsRouterError {
    let source = match err {
        WsRouterError::AdapterError(e) => e,
        other => anyhow::anyhow!(other.to_string()),
    };
    WsRouterError::TopicsBatchRollback { source, rollback_failed }
}

/// One connection's topic membership. Snapshot reads (`values`, `size`,
/// `has`, `status`) never block on in-flight mutations and never see a
/// partial batch.
pub struct Topics {
    client_id: String,
    adapter: Arc<dyn TopicSocketAdapter>,
    sink: Arc<dyn ConnectionSink>,
    config: TopicsConfig,
    normalizer: Option<Normalizer>,
    committed: RwLock<HashSet<String>>,
    in_flight: DashMap<String, Arc<AsyncMutex<()>>>,
    pending: DashMap<String, PendingOp>,
}

impl Topics {
    pub fn new(
        client_id: impl Into<String>,
        adapter: Arc<dyn TopicSocketAdapter>,
        sink: Arc<dyn ConnectionSink>,
        config: TopicsConfig,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            adapter,
            sink,
            config,
            normalizer: None,
            committed: RwLock::new(HashSet::new()),
            in_flight: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    fn normalize(&self, topic: &str) -> String {
        match &self.normalizer {
            Some(f) => f(topic),
            None => topic.to_string(),
        }
    }

    fn validate(&self, topic: &str) -> WsRouterResult<()> {
        if topic.is_empty() || topic.len() > self.config.max_length {
            return Err(WsRouterError::InvalidTopic {
                topic: topic.to_string(),
                reason: "length".into(),
            });
        }
        if !self.config.pattern.is_match(topic) {
            return Err(WsRouterError::InvalidTopic {
                topic: topic.to_string(),
                reason: "pattern".into(),
            });
        }
        Ok(())
    }

    fn check_open(&self) -> WsRouterResult<()> {
        if self.sink.ready_state() != ReadyState::Open {
            return Err(WsRouterError::ConnectionClosed);
        }
        Ok(())
    }

    /// Acquires the per-topic in-flight locks in sorted order (dedup'd) so
    /// concurrent batch ops touching overlapping topic sets never deadlock.
    async fn lock_topics(&self, topics: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<String> = topics.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for topic in sorted {
            let mutex = self
                .in_flight
                .entry(topic)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone();
            guards.push(mutex.lock_owned().await);
        }
        guards
    }

    fn mark_pending(&self, topics: &[String], op: PendingOp) {
        for topic in topics {
            self.pending.insert(topic.clone(), op);
        }
    }

    fn clear_pending(&self, topics: &[String]) {
        for topic in topics {
            self.pending.remove(topic);
        }
    }

    pub fn has(&self, topic: &str) -> bool {
        self.committed.read().contains(topic)
    }

    /// Precise subscription state (spec §3 line 57), distinct from `has`:
    /// reports `pending-subscribe`/`pending-unsubscribe` while an adapter
    /// call for this topic is in flight.
    pub fn status(&self, topic: &str) -> TopicStatus {
        if let Some(pending) = self.pending.get(topic) {
            return match *pending {
                PendingOp::Subscribe => TopicStatus::PendingSubscribe,
                PendingOp::Unsubscribe => TopicStatus::PendingUnsubscribe,
            };
        }
        if self.committed.read().contains(topic) {
            TopicStatus::Settled
        } else {
            TopicStatus::Absent
        }
    }

    pub fn size(&self) -> usize {
        self.committed.read().len()
    }

    /// Snapshot taken at the moment of the call; later mutations never
    /// affect the returned `Vec` (spec §4.7 "Iteration").
    pub fn values(&self) -> Vec<String> {
        self.committed.read().iter().cloned().collect()
    }

    /// After a successful adapter call, honors `opts.waitFor`/`opts.verify`
    /// by calling [`TopicSocketAdapter::verify`]. Returns `Ok(())` when
    /// nothing more needs to happen or verification confirmed the expected
    /// state; returns `Err` only under `VerifyLevel::Strict` when the
    /// adapter did not confirm it.
    async fn confirm_settled(&self, topic: &str, expect_op: PendingOp, opts: &TopicOpOptions) -> WsRouterResult<()> {
        if opts.wait_for != WaitFor::Settled || opts.verify == VerifyLevel::Off {
            return Ok(());
        }

        let outcome = self.adapter.verify(&self.client_id, topic).await;
        let confirmed = matches!(
            (expect_op, &outcome),
            (PendingOp::Subscribe, Ok(VerifyKind::Subscribed)) | (PendingOp::Unsubscribe, Ok(VerifyKind::Unsubscribed))
        );

        if confirmed || opts.verify == VerifyLevel::BestEffort {
            return Ok(());
        }

        Err(WsRouterError::AdapterError(anyhow::anyhow!(
            "strict verify after {:?} on {} did not confirm (got {:?})",
            expect_op,
            topic,
            outcome
        )))
    }

    pub async fn subscribe(&self, topic: &str, opts: TopicOpOptions) -> WsRouterResult<bool> {
        check_signal(&opts)?;

        let topic = self.normalize(topic);
        self.validate(&topic)?;

        with_timeout(&opts, async {
            let _guard = self.lock_topics(std::slice::from_ref(&topic)).await;
            check_signal(&opts)?;

            if self.committed.read().contains(&topic) {
                return Ok(false);
            }

            if self.committed.read().len() + 1 > self.config.max_topics {
                return Err(WsRouterError::TopicLimitExceeded);
            }

            self.check_open()?;

            self.pending.insert(topic.clone(), PendingOp::Subscribe);

            if let Err(source) = self.adapter.subscribe(&self.client_id, &topic).await {
                self.pending.remove(&topic);
                return Err(WsRouterError::AdapterError(source));
            }

            if let Err(err) = self.confirm_settled(&topic, PendingOp::Subscribe, &opts).await {
                if let Err(rollback_err) = self.adapter.unsubscribe(&self.client_id, &topic).await {
                    warn!(%topic, ?rollback_err, "rollback unsubscribe after failed strict verify also failed");
                }
                self.pending.remove(&topic);
                return Err(err);
            }

            self.pending.remove(&topic);
            self.committed.write().insert(topic.clone());
            Ok(true)
        })
        .await
    }

    pub async fn unsubscribe(&self, topic: &str, opts: TopicOpOptions) -> WsRouterResult<bool> {
        check_signal(&opts)?;

        let topic = self.normalize(topic);

        with_timeout(&opts, async {
            let _guard = self.lock_topics(std::slice::from_ref(&topic)).await;
            check_signal(&opts)?;

            if !self.committed.read().contains(&topic) {
                return Ok(false);
            }

            self.pending.insert(topic.clone(), PendingOp::Unsubscribe);

            if let Err(source) = self.adapter.unsubscribe(&self.client_id, &topic).await {
                self.pending.remove(&topic);
                return Err(WsRouterError::AdapterError(source));
            }

            if let Err(err) = self.confirm_settled(&topic, PendingOp::Unsubscribe, &opts).await {
                if let Err(rollback_err) = self.adapter.subscribe(&self.client_id, &topic).await {
                    warn!(%topic, ?rollback_err, "rollback subscribe after failed strict verify also failed");
                }
                self.pending.remove(&topic);
                return Err(err);
            }

            self.pending.remove(&topic);
            self.committed.write().remove(&topic);
            Ok(true)
        })
        .await
    }

    pub async fn subscribe_many(&self, topics: Vec<String>, opts: TopicOpOptions) -> WsRouterResult<BatchReport> {
        check_signal(&opts)?;

        let mut unique: Vec<String> = topics.iter().map(|t| self.normalize(t)).collect();
        unique.sort();
        unique.dedup();

        for topic in &unique {
            self.validate(topic)?;
        }

        with_timeout(&opts, async {
            let _guards = self.lock_topics(&unique).await;
            check_signal(&opts)?;

            let to_add: Vec<String> = {
                let committed = self.committed.read();
                unique.iter().filter(|t| !committed.contains(*t)).cloned().collect()
            };

            let projected = self.committed.read().len() + to_add.len();
            if projected > self.config.max_topics {
                return Err(WsRouterError::TopicLimitExceeded);
            }

            if to_add.is_empty() {
                return Ok(BatchReport {
                    added: 0,
                    removed: 0,
                    total: self.committed.read().len(),
                });
            }

            self.check_open()?;
            self.mark_pending(&to_add, PendingOp::Subscribe);

            let mut committed_so_far = Vec::with_capacity(to_add.len());
            for topic in &to_add {
                match self.adapter.subscribe(&self.client_id, topic).await {
                    Ok(()) => committed_so_far.push(topic.clone()),
                    Err(source) => {
                        let rollback_failed = self.rollback_subscribes(&committed_so_far).await;
                        self.clear_pending(&to_add);
                        return Err(WsRouterError::TopicsBatchRollback { source, rollback_failed });
                    }
                }
            }

            for topic in &to_add {
                if let Err(err) = self.confirm_settled(topic, PendingOp::Subscribe, &opts).await {
                    let rollback_failed = self.rollback_subscribes(&committed_so_far).await;
                    self.clear_pending(&to_add);
                    return Err(rollback_error(err, rollback_failed));
                }
            }

            self.clear_pending(&to_add);

            let mut committed = self.committed.write();
            for topic in &to_add {
                committed.insert(topic.clone());
            }
            let total = committed.len();
            drop(committed);

            Ok(BatchReport {
                added: to_add.len(),
                removed: 0,
                total,
            })
        })
        .await
    }

    pub async fn unsubscribe_many(&self, topics: Vec<String>, opts: TopicOpOptions) -> WsRouterResult<BatchReport> {
        check_signal(&opts)?;

        let mut unique: Vec<String> = topics.iter().map(|t| self.normalize(t)).collect();
        unique.sort();
        unique.dedup();

        with_timeout(&opts, async {
            let _guards = self.lock_topics(&unique).await;
            check_signal(&opts)?;

            let to_remove: Vec<String> = {
                let committed = self.committed.read();
                unique.iter().filter(|t| committed.contains(t)).cloned().collect()
            };

            if to_remove.is_empty() {
                return Ok(BatchReport {
                    added: 0,
                    removed: 0,
                    total: self.committed.read().len(),
                });
            }

            self.mark_pending(&to_remove, PendingOp::Unsubscribe);

            let mut committed_so_far = Vec::with_capacity(to_remove.len());
            for topic in &to_remove {
                match self.adapter.unsubscribe(&self.client_id, topic).await {
                    Ok(()) => committed_so_far.push(topic.clone()),
                    Err(source) => {
                        let rollback_failed = self.rollback_unsubscribes(&committed_so_far).await;
                        self.clear_pending(&to_remove);
                        return Err(WsRouterError::TopicsBatchRollback { source, rollback_failed });
                    }
                }
            }

            for topic in &to_remove {
                if let Err(err) = self.confirm_settled(topic, PendingOp::Unsubscribe, &opts).await {
                    let rollback_failed = self.rollback_unsubscribes(&committed_so_far).await;
                    self.clear_pending(&to_remove);
                    return Err(rollback_error(err, rollback_failed));
                }
            }

            self.clear_pending(&to_remove);

            let mut committed = self.committed.write();
            for topic in &to_remove {
                committed.remove(topic);
            }
            let total = committed.len();
            drop(committed);

            Ok(BatchReport {
                added: 0,
                removed: to_remove.len(),
                total,
            })
        })
        .await
    }

    /// `set(desired)` (spec §4.7 "Replace"). Uses the adapter's native
    /// `replace` when available; otherwise falls back to unsubscribe-then-
    /// subscribe under the same in-flight locks, rolling back symmetrically.
    pub async fn set(&self, desired: HashSet<String>, opts: TopicOpOptions) -> WsRouterResult<BatchReport> {
        check_signal(&opts)?;

        let desired: HashSet<String> = desired.iter().map(|t| self.normalize(t)).collect();
        for topic in &desired {
            self.validate(topic)?;
        }

        with_timeout(&opts, async {
            let (to_add, to_remove): (Vec<String>, Vec<String>) = {
                let committed = self.committed.read();
                let to_add = desired.difference(&committed).cloned().collect();
                let to_remove = committed.difference(&desired).cloned().collect();
                (to_add, to_remove)
            };

            if to_add.is_empty() && to_remove.is_empty() {
                return Ok(BatchReport {
                    added: 0,
                    removed: 0,
                    total: self.committed.read().len(),
                });
            }

            let union: Vec<String> = to_add.iter().chain(to_remove.iter()).cloned().collect();
            let _guards = self.lock_topics(&union).await;
            check_signal(&opts)?;

            if desired.len() > self.config.max_topics {
                return Err(WsRouterError::TopicLimitExceeded);
            }

            if !to_add.is_empty() {
                self.check_open()?;
            }

            self.mark_pending(&to_add, PendingOp::Subscribe);
            self.mark_pending(&to_remove, PendingOp::Unsubscribe);

            let desired_vec: Vec<String> = desired.iter().cloned().collect();
            match self.adapter.replace(&self.client_id, &desired_vec).await {
                Ok(true) => {
                    // A native replace is atomic on the adapter side and has no
                    // generic inverse, so a strict verify mismatch here is
                    // logged rather than rolled back.
                    for topic in &to_add {
                        if let Err(err) = self.confirm_settled(topic, PendingOp::Subscribe, &opts).await {
                            warn!(%topic, ?err, "strict verify after replace did not confirm subscribe");
                        }
                    }
                    for topic in &to_remove {
                        if let Err(err) = self.confirm_settled(topic, PendingOp::Unsubscribe, &opts).await {
                            warn!(%topic, ?err, "strict verify after replace did not confirm unsubscribe");
                        }
                    }

                    self.clear_pending(&to_add);
                    self.clear_pending(&to_remove);

                    let mut committed = self.committed.write();
                    *committed = desired;
                    let total = committed.len();
                    return Ok(BatchReport {
                        added: to_add.len(),
                        removed: to_remove.len(),
                        total,
                    });
                }
                Ok(false) => {}
                Err(source) => {
                    self.clear_pending(&to_add);
                    self.clear_pending(&to_remove);
                    return Err(WsRouterError::TopicsBatchRollback {
                        source,
                        rollback_failed: Vec::new(),
                    });
                }
            }

            // Fallback: unsubscribe first to free space, then subscribe.
            let mut removed_so_far = Vec::with_capacity(to_remove.len());
            for topic in &to_remove {
                match self.adapter.unsubscribe(&self.client_id, topic).await {
                    Ok(()) => removed_so_far.push(topic.clone()),
                    Err(source) => {
                        let rollback_failed = self.rollback_unsubscribes(&removed_so_far).await;
                        self.clear_pending(&to_add);
                        self.clear_pending(&to_remove);
                        return Err(WsRouterError::TopicsBatchRollback { source, rollback_failed });
                    }
                }
            }

            let mut added_so_far = Vec::with_capacity(to_add.len());
            for topic in &to_add {
                match self.adapter.subscribe(&self.client_id, topic).await {
                    Ok(()) => added_so_far.push(topic.clone()),
                    Err(source) => {
                        let mut rollback_failed = self.rollback_subscribes(&added_so_far).await;
                        rollback_failed.extend(self.rollback_unsubscribes(&removed_so_far).await);
                        self.clear_pending(&to_add);
                        self.clear_pending(&to_remove);
                        return Err(WsRouterError::TopicsBatchRollback { source, rollback_failed });
                    }
                }
            }

            for topic in &to_remove {
                if let Err(err) = self.confirm_settled(topic, PendingOp::Unsubscribe, &opts).await {
                    let mut rollback_failed = self.rollback_unsubscribes(&removed_so_far).await;
                    rollback_failed.extend(self.rollback_subscribes(&added_so_far).await);
                    self.clear_pending(&to_add);
                    self.clear_pending(&to_remove);
                    return Err(rollback_error(err, rollback_failed));
                }
            }
            for topic in &to_add {
                if let Err(err) = self.confirm_settled(topic, PendingOp::Subscribe, &opts).await {
                    let mut rollback_failed = self.rollback_subscribes(&added_so_far).await;
                    rollback_failed.extend(self.rollback_unsubscribes(&removed_so_far).await);
                    self.clear_pending(&to_add);
                    self.clear_pending(&to_remove);
                    return Err(rollback_error(err, rollback_failed));
                }
            }

            self.clear_pending(&to_add);
            self.clear_pending(&to_remove);

            let mut committed = self.committed.write();
            for topic in &to_remove {
                committed.remove(topic);
            }
            for topic in &to_add {
                committed.insert(topic.clone());
            }
            let total = committed.len();
            drop(committed);

            Ok(BatchReport {
                added: to_add.len(),
                removed: to_remove.len(),
                total,
            })
        })
        .await
    }

    pub async fn verify(&self, topic: &str) -> WsRouterResult<VerifyKind> {
        self.adapter
            .verify(&self.client_id, topic)
            .await
            .map_err(WsRouterError::AdapterError)
    }

    /// Inverse of a run of successful `subscribe` calls, in reverse order.
    /// Topics whose inverse call also fails are returned for
    /// `details.rollbackFailed`.
    async fn rollback_subscribes(&self, committed: &[String]) -> Vec<String> {
        let mut failed = Vec::new();
        for topic in committed.iter().rev() {
            if let Err(err) = self.adapter.unsubscribe(&self.client_id, topic).await {
                warn!(%topic, ?err, "rollback unsubscribe failed");
                failed.push(topic.clone());
            }
        }
        failed
    }

    async fn rollback_unsubscribes(&self, committed: &[String]) -> Vec<String> {
        let mut failed = Vec::new();
        for topic in committed.iter().rev() {
            if let Err(err) = self.adapter.subscribe(&self.client_id, topic).await {
                warn!(%topic, ?err, "rollback subscribe failed");
                failed.push(topic.clone());
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{OutboundData, ReadyState as RS};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NullSink(std::sync::atomic::AtomicBool);
    impl ConnectionSink for NullSink {
        fn send(&self, _data: OutboundData) {}
        fn close(&self, _code: Option<u16>, _reason: Option<String>) {}
        fn ready_state(&self) -> RS {
            if self.0.load(Ordering::SeqCst) {
                RS::Closed
            } else {
                RS::Open
            }
        }
    }

    struct FailingAfterN {
        calls: AtomicUsize,
        fail_at: usize,
    }

    #[async_trait::async_trait]
    impl TopicSocketAdapter for FailingAfterN {
        async fn subscribe(&self, _client_id: &str, _topic: &str) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == self.fail_at {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        async fn unsubscribe(&self, _client_id: &str, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct AlwaysOkAdapter(AtomicUsize);
    #[async_trait::async_trait]
    impl TopicSocketAdapter for AlwaysOkAdapter {
        async fn subscribe(&self, _client_id: &str, _topic: &str) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn unsubscribe(&self, _client_id: &str, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct SlowAdapter;
    #[async_trait::async_trait]
    impl TopicSocketAdapter for SlowAdapter {
        async fn subscribe(&self, _client_id: &str, _topic: &str) -> anyhow::Result<()> {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            Ok(())
        }
        async fn unsubscribe(&self, _client_id: &str, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct BlockingAdapter(Arc<tokio::sync::Notify>);
    #[async_trait::async_trait]
    impl TopicSocketAdapter for BlockingAdapter {
        async fn subscribe(&self, _client_id: &str, _topic: &str) -> anyhow::Result<()> {
            self.0.notified().await;
            Ok(())
        }
        async fn unsubscribe(&self, _client_id: &str, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct VerifyingAdapter(VerifyKind);
    #[async_trait::async_trait]
    impl TopicSocketAdapter for VerifyingAdapter {
        async fn subscribe(&self, _client_id: &str, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn unsubscribe(&self, _client_id: &str, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn verify(&self, _client_id: &str, _topic: &str) -> anyhow::Result<VerifyKind> {
            Ok(self.0)
        }
    }

    fn config() -> TopicsConfig {
        TopicsConfig {
            max_topics: 3,
            pattern: Regex::new(r"^[a-z0-9-]+$").unwrap(),
            max_length: 32,
        }
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let topics = Topics::new(
            "c1",
            Arc::new(AlwaysOkAdapter(AtomicUsize::new(0))),
            Arc::new(NullSink(AtomicBool::new(false))),
            config(),
        );

        assert!(topics.subscribe("a", TopicOpOptions::default()).await.unwrap());
        assert!(!topics.subscribe("a", TopicOpOptions::default()).await.unwrap());
        assert_eq!(topics.size(), 1);
    }

    #[tokio::test]
    async fn subscribe_rejects_invalid_topic() {
        let topics = Topics::new(
            "c1",
            Arc::new(AlwaysOkAdapter(AtomicUsize::new(0))),
            Arc::new(NullSink(AtomicBool::new(false))),
            config(),
        );

        let err = topics.subscribe("Bad Topic!", TopicOpOptions::default()).await.unwrap_err();
        assert!(matches!(err, WsRouterError::InvalidTopic { .. }));
    }

    #[tokio::test]
    async fn subscribe_enforces_limit() {
        let topics = Topics::new(
            "c1",
            Arc::new(AlwaysOkAdapter(AtomicUsize::new(0))),
            Arc::new(NullSink(AtomicBool::new(false))),
            config(),
        );

        topics.subscribe("a", TopicOpOptions::default()).await.unwrap();
        topics.subscribe("b", TopicOpOptions::default()).await.unwrap();
        topics.subscribe("c", TopicOpOptions::default()).await.unwrap();

        let err = topics.subscribe("d", TopicOpOptions::default()).await.unwrap_err();
        assert!(matches!(err, WsRouterError::TopicLimitExceeded));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_topic_is_a_soft_no_op() {
        let topics = Topics::new(
            "c1",
            Arc::new(AlwaysOkAdapter(AtomicUsize::new(0))),
            Arc::new(NullSink(AtomicBool::new(false))),
            config(),
        );

        assert!(!topics.unsubscribe("never-subscribed", TopicOpOptions::default()).await.unwrap());
    }

    #[tokio::test]
    async fn subscribe_fails_when_connection_closed() {
        let topics = Topics::new(
            "c1",
            Arc::new(AlwaysOkAdapter(AtomicUsize::new(0))),
            Arc::new(NullSink(AtomicBool::new(true))),
            config(),
        );

        let err = topics.subscribe("a", TopicOpOptions::default()).await.unwrap_err();
        assert!(matches!(err, WsRouterError::ConnectionClosed));
    }

    #[tokio::test]
    async fn batch_subscribe_rolls_back_on_partial_failure() {
        let topics = Topics::new(
            "c1",
            Arc::new(FailingAfterN {
                calls: AtomicUsize::new(0),
                fail_at: 1,
            }),
            Arc::new(NullSink(AtomicBool::new(false))),
            config(),
        );

        let err = topics
            .subscribe_many(vec!["a".to_string(), "b".to_string(), "c".to_string()], TopicOpOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, WsRouterError::TopicsBatchRollback { .. }));
        assert_eq!(topics.size(), 0, "rolled-back batch must not mutate local state");
    }

    #[tokio::test]
    async fn batch_subscribe_succeeds_atomically() {
        let topics = Topics::new(
            "c1",
            Arc::new(AlwaysOkAdapter(AtomicUsize::new(0))),
            Arc::new(NullSink(AtomicBool::new(false))),
            config(),
        );

        let report = topics
            .subscribe_many(vec!["a".to_string(), "b".to_string()], TopicOpOptions::default())
            .await
            .unwrap();

        assert_eq!(report, BatchReport { added: 2, removed: 0, total: 2 });
    }

    #[tokio::test]
    async fn values_is_a_point_in_time_snapshot() {
        let topics = Topics::new(
            "c1",
            Arc::new(AlwaysOkAdapter(AtomicUsize::new(0))),
            Arc::new(NullSink(AtomicBool::new(false))),
            config(),
        );

        topics.subscribe("a", TopicOpOptions::default()).await.unwrap();
        let snapshot = topics.values();
        topics.subscribe("b", TopicOpOptions::default()).await.unwrap();

        assert_eq!(snapshot, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn set_computes_add_and_remove_diff() {
        let topics = Topics::new(
            "c1",
            Arc::new(AlwaysOkAdapter(AtomicUsize::new(0))),
            Arc::new(NullSink(AtomicBool::new(false))),
            config(),
        );

        topics.subscribe("a", TopicOpOptions::default()).await.unwrap();
        topics.subscribe("b", TopicOpOptions::default()).await.unwrap();

        let desired: HashSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        let report = topics.set(desired, TopicOpOptions::default()).await.unwrap();

        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(report.total, 2);
        assert!(topics.has("b"));
        assert!(topics.has("c"));
        assert!(!topics.has("a"));
    }

    #[tokio::test]
    async fn status_reports_absent_then_settled() {
        let topics = Topics::new(
            "c1",
            Arc::new(AlwaysOkAdapter(AtomicUsize::new(0))),
            Arc::new(NullSink(AtomicBool::new(false))),
            config(),
        );

        assert_eq!(topics.status("a"), TopicStatus::Absent);
        topics.subscribe("a", TopicOpOptions::default()).await.unwrap();
        assert_eq!(topics.status("a"), TopicStatus::Settled);
    }

    #[tokio::test]
    async fn status_reports_pending_subscribe_while_adapter_call_in_flight() {
        let notify = Arc::new(tokio::sync::Notify::new());
        let topics = Arc::new(Topics::new(
            "c1",
            Arc::new(BlockingAdapter(notify.clone())),
            Arc::new(NullSink(AtomicBool::new(false))),
            config(),
        ));

        let t2 = topics.clone();
        let handle = tokio::spawn(async move { t2.subscribe("a", TopicOpOptions::default()).await });

        for _ in 0..100 {
            if topics.status("a") == TopicStatus::PendingSubscribe {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(topics.status("a"), TopicStatus::PendingSubscribe);

        notify.notify_one();
        handle.await.unwrap().unwrap();
        assert_eq!(topics.status("a"), TopicStatus::Settled);
    }

    #[tokio::test]
    async fn signal_already_set_aborts_before_any_adapter_call() {
        let adapter = Arc::new(AlwaysOkAdapter(AtomicUsize::new(0)));
        let topics = Topics::new("c1", adapter.clone(), Arc::new(NullSink(AtomicBool::new(false))), config());

        let signal: SendSignal = Arc::new(AtomicBool::new(true));
        let opts = TopicOpOptions {
            signal: Some(signal),
            ..Default::default()
        };

        let err = topics.subscribe("a", opts).await.unwrap_err();
        assert!(matches!(err, WsRouterError::FailedPrecondition(_)));
        assert_eq!(adapter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_ms_elapses_returns_an_adapter_error() {
        let topics = Topics::new("c1", Arc::new(SlowAdapter), Arc::new(NullSink(AtomicBool::new(false))), config());

        let opts = TopicOpOptions {
            timeout_ms: Some(10),
            ..Default::default()
        };

        let err = topics.subscribe("a", opts).await.unwrap_err();
        assert!(matches!(err, WsRouterError::AdapterError(_)));
    }

    #[tokio::test]
    async fn strict_verify_mismatch_rolls_back_subscribe() {
        let topics = Topics::new(
            "c1",
            Arc::new(VerifyingAdapter(VerifyKind::Unsubscribed)),
            Arc::new(NullSink(AtomicBool::new(false))),
            config(),
        );

        let opts = TopicOpOptions {
            wait_for: WaitFor::Settled,
            verify: VerifyLevel::Strict,
            ..Default::default()
        };

        let err = topics.subscribe("a", opts).await.unwrap_err();
        assert!(matches!(err, WsRouterError::AdapterError(_)));
        assert!(!topics.has("a"), "strict verify failure must roll back local state");
    }

    #[tokio::test]
    async fn best_effort_verify_mismatch_still_commits() {
        let topics = Topics::new(
            "c1",
            Arc::new(VerifyingAdapter(VerifyKind::Unsubscribed)),
            Arc::new(NullSink(AtomicBool::new(false))),
            config(),
        );

        let opts = TopicOpOptions {
            wait_for: WaitFor::Settled,
            verify: VerifyLevel::BestEffort,
            ..Default::default()
        };

        assert!(topics.subscribe("a", opts).await.unwrap());
        assert!(topics.has("a"));
    }
}
