//! Per-connection subscription primitives (spec §4.3, §4.7). Distinct from
//! [`crate::pubsub::PubSubDriver`]: this trait is the thing a single
//! connection's `Topics` set calls into, not the global subscriber index.

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyKind {
    Subscribed,
    Unsubscribed,
    Unsupported,
    Error,
    Timeout,
}

/// Adapter-side primitive for one connection's topic membership. Every
/// mutating method is adapter-first, state-second from the caller's point of
/// view (`Topics` only mutates its local set after the adapter call
/// succeeds — see spec §4.7 step 6/7).
#[async_trait]
pub trait TopicSocketAdapter: Send + Sync {
    async fn subscribe(&self, client_id: &str, topic: &str) -> anyhow::Result<()>;

    async fn unsubscribe(&self, client_id: &str, topic: &str) -> anyhow::Result<()>;

    /// Native atomic replace, if the adapter has one. `Topics::set` falls
    /// back to sequenced unsubscribe-then-subscribe when this returns
    /// `Ok(false)` (unsupported) rather than actually replacing anything.
    async fn replace(&self, _client_id: &str, _topics: &[String]) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Probes the adapter for subscription truth (spec §4.7 "Verify").
    /// Defaults to `Unsupported` for adapters with no verification
    /// capability.
    async fn verify(&self, _client_id: &str, _topic: &str) -> anyhow::Result<VerifyKind> {
        Ok(VerifyKind::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopAdapter;

    #[async_trait]
    impl TopicSocketAdapter for NoopAdapter {
        async fn subscribe(&self, _client_id: &str, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn unsubscribe(&self, _client_id: &str, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_replace_reports_unsupported() {
        let adapter = NoopAdapter;
        assert_eq!(adapter.replace("c1", &["a".to_string()]).await.unwrap(), false);
    }

    #[tokio::test]
    async fn default_verify_reports_unsupported() {
        let adapter = NoopAdapter;
        assert_eq!(adapter.verify("c1", "a").await.unwrap(), VerifyKind::Unsupported);
    }
}
