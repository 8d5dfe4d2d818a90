use std::sync::Arc;

use serde::Serialize;

use crate::codec::{CodecError, JsonCodec};
use crate::messaging::{ConfirmEvent, PublishError, Publisher};
use crate::metrics::Metrics;
use crate::model::{CorrelationId, OutboundEnvelope};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::StoreError;

use super::counter::RetryCounters;

const OPAQUE_CONTENT_TYPE: &str = "application/octet-stream";

// ── Error ──────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Retry bookkeeping could not be read or written. The message stays in
    /// flight: it is neither re-published nor dropped.
    #[error("retry bookkeeping failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl TrackerError {
    /// Infrastructure failure (store or channel pool) as opposed to a
    /// message-level one.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::Store(_) => true,
            Self::Publish(e) => e.is_resource_exhausted(),
            Self::Codec(_) => false,
        }
    }
}

// ── Outcome ────────────────────────────────────────────────────────────────────

/// A message given up on after exhausting its retry budget.
#[derive(Debug, Clone)]
pub struct PermanentPublishFailure {
    pub envelope: OutboundEnvelope,
    pub failures: u32,
    pub last_reason: String,
}

/// What handling one confirm led to.
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    /// Broker accepted the message; its counter is gone.
    Confirmed,
    /// Broker refused it and the same envelope was published again.
    Retried { attempt: u32 },
    /// Terminal: dropped without further publishes.
    PermanentFailure(PermanentPublishFailure),
}

// ── CorrelationTracker ─────────────────────────────────────────────────────────

/// Publishes messages under a correlation id and reacts to their confirms.
///
/// A nacked publish is re-published with the same correlation id until the
/// failure count recorded in [`RetryCounters`] reaches the policy's limit,
/// at which point the message is dropped and reported as a
/// [`PermanentPublishFailure`]. A positive confirm deletes the counter.
pub struct CorrelationTracker {
    publisher: Arc<dyn Publisher>,
    counters: RetryCounters,
    policy: RetryPolicy,
    codec: JsonCodec,
    metrics: Arc<Metrics>,
}

impl CorrelationTracker {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        counters: RetryCounters,
        policy: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            publisher,
            counters,
            policy,
            codec: JsonCodec,
            metrics,
        }
    }

    pub fn counters(&self) -> &RetryCounters {
        &self.counters
    }

    /// Publish an opaque payload. Returns as soon as the broker has it; the
    /// confirm is handled later by [`on_confirm`](Self::on_confirm).
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<CorrelationId, TrackerError> {
        let envelope = OutboundEnvelope::new(exchange, routing_key, payload, OPAQUE_CONTENT_TYPE);
        self.publish_envelope(envelope).await
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish_json<T: Serialize + Sync>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<CorrelationId, TrackerError> {
        let payload = self.codec.encode(value)?;
        let envelope =
            OutboundEnvelope::new(exchange, routing_key, payload, self.codec.content_type());
        self.publish_envelope(envelope).await
    }

    async fn publish_envelope(
        &self,
        envelope: OutboundEnvelope,
    ) -> Result<CorrelationId, TrackerError> {
        if let Err(e) = self.publisher.publish(&envelope).await {
            self.count_publish_error(&e);
            return Err(e.into());
        }
        self.metrics.inc_published();

        tracing::debug!(
            correlation_id = %envelope.correlation_id,
            exchange = %envelope.exchange,
            routing_key = %envelope.routing_key,
            "📤 published"
        );
        Ok(envelope.correlation_id)
    }

    fn count_publish_error(&self, e: &PublishError) {
        if e.is_resource_exhausted() {
            self.metrics.inc_pool_exhausted();
        }
    }

    /// Handle the broker's verdict on one publish attempt.
    ///
    /// A re-publish that fails outright (no channel within the checkout
    /// timeout, closed connection) counts as one more failed attempt, so the
    /// loop below is bounded by the same retry budget as broker nacks.
    pub async fn on_confirm(&self, event: ConfirmEvent) -> Result<ConfirmOutcome, TrackerError> {
        let ConfirmEvent {
            envelope,
            accepted,
            reason,
        } = event;
        let id = &envelope.correlation_id;

        if accepted {
            self.counters.clear(id).await?;
            self.metrics.inc_confirmed();
            tracing::debug!(correlation_id = %id, "✅ confirmed");
            return Ok(ConfirmOutcome::Confirmed);
        }

        let mut reason = reason.unwrap_or_else(|| "no reason given".to_string());

        loop {
            let failures = self.counters.record_failure(id).await?;

            match self.policy.decide(failures) {
                RetryDecision::GiveUp => {
                    self.metrics.inc_dropped();
                    tracing::error!(
                        correlation_id = %id,
                        failures,
                        exchange = %envelope.exchange,
                        routing_key = %envelope.routing_key,
                        reason = %reason,
                        "❌ publish failed permanently, dropping message"
                    );
                    return Ok(ConfirmOutcome::PermanentFailure(PermanentPublishFailure {
                        envelope,
                        failures,
                        last_reason: reason,
                    }));
                }
                RetryDecision::Retry { attempt } => {
                    tracing::warn!(
                        correlation_id = %id,
                        attempt,
                        max = self.policy.max_retries,
                        reason = %reason,
                        "🔄 publish rejected, re-publishing"
                    );

                    match self.publisher.publish(&envelope).await {
                        Ok(()) => {
                            self.metrics.inc_retried();
                            return Ok(ConfirmOutcome::Retried { attempt });
                        }
                        Err(e) => {
                            self.count_publish_error(&e);
                            tracing::error!(
                                correlation_id = %id,
                                attempt,
                                error = %e,
                                "re-publish failed, counting it as another failed attempt"
                            );
                            reason = e.to_string();
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{event_channel, BrokerEvent, EventReceiver, InMemoryBroker, Reply};
    use crate::retry::MAX_RETRIES;
    use crate::store::{InMemoryStore, KvStore};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Harness {
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryStore>,
        metrics: Arc<Metrics>,
        tracker: CorrelationTracker,
        events: EventReceiver,
    }

    fn harness(replies: Vec<Reply>, fallback: Reply) -> Harness {
        let (tx, events) = event_channel();
        let broker = Arc::new(
            InMemoryBroker::new(tx)
                .with_script(replies)
                .with_fallback(fallback),
        );
        let store = Arc::new(InMemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let tracker = CorrelationTracker::new(
            broker.clone(),
            RetryCounters::new(store.clone(), "publish:retry"),
            RetryPolicy::default(),
            metrics.clone(),
        );
        Harness { broker, store, metrics, tracker, events }
    }

    impl Harness {
        async fn next_confirm(&mut self) -> ConfirmEvent {
            match self.events.recv().await {
                Some(BrokerEvent::Confirm(c)) => c,
                other => panic!("expected a confirm, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn k_nacks_then_ack_republish_k_times_and_clean_up() {
        for k in 0..MAX_RETRIES {
            let mut replies: Vec<_> = (0..k).map(|_| Reply::Nack("busy".into())).collect();
            replies.push(Reply::Ack);
            let mut h = harness(replies, Reply::Ack);

            h.tracker.publish("ex", "rk", b"p".to_vec()).await.unwrap();

            let mut retries = 0;
            loop {
                let confirm = h.next_confirm().await;
                match h.tracker.on_confirm(confirm).await.unwrap() {
                    ConfirmOutcome::Retried { .. } => retries += 1,
                    ConfirmOutcome::Confirmed => break,
                    other => panic!("unexpected {other:?}"),
                }
            }

            assert_eq!(retries, k, "k = {k}");
            assert_eq!(h.broker.publish_count(), k as usize + 1);
            assert!(h.store.is_empty(), "counter left behind for k = {k}");
        }
    }

    #[tokio::test]
    async fn fifth_nack_drops_without_a_sixth_publish() {
        let mut h = harness(vec![], Reply::Nack("queue full".into()));

        let id = h.tracker.publish("ex", "rk", b"p".to_vec()).await.unwrap();

        let mut attempts = Vec::new();
        let failure = loop {
            let confirm = h.next_confirm().await;
            match h.tracker.on_confirm(confirm).await.unwrap() {
                ConfirmOutcome::Retried { attempt } => attempts.push(attempt),
                ConfirmOutcome::PermanentFailure(f) => break f,
                ConfirmOutcome::Confirmed => panic!("nothing should confirm"),
            }
        };

        assert_eq!(attempts, vec![1, 2, 3, 4]);
        assert_eq!(failure.failures, MAX_RETRIES);
        assert_eq!(failure.envelope.correlation_id, id);
        assert_eq!(failure.last_reason, "queue full");
        assert_eq!(h.broker.publish_count(), MAX_RETRIES as usize);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_retry_reuses_the_envelope() {
        let mut h = harness(vec![Reply::Nack("x".into()), Reply::Nack("y".into())], Reply::Ack);
        h.tracker
            .publish_json("ex", "rk", &crate::model::User::new(1, "ada", "ada@example.com"))
            .await
            .unwrap();

        loop {
            let confirm = h.next_confirm().await;
            if let ConfirmOutcome::Confirmed = h.tracker.on_confirm(confirm).await.unwrap() {
                break;
            }
        }

        let published = h.broker.published();
        assert_eq!(published.len(), 3);
        assert!(published.iter().all(|e| e.correlation_id == published[0].correlation_id));
        assert!(published.iter().all(|e| e.payload == published[0].payload));
        assert_eq!(published[0].content_type, JsonCodec::CONTENT_TYPE);
    }

    #[tokio::test]
    async fn failed_republishes_count_against_the_budget() {
        let mut h = harness(vec![Reply::Nack("busy".into())], Reply::Exhausted);

        h.tracker.publish("ex", "rk", b"p".to_vec()).await.unwrap();
        let confirm = h.next_confirm().await;

        match h.tracker.on_confirm(confirm).await.unwrap() {
            ConfirmOutcome::PermanentFailure(f) => {
                assert_eq!(f.failures, MAX_RETRIES);
                assert!(f.last_reason.contains("no channel free"), "{}", f.last_reason);
            }
            other => panic!("unexpected {other:?}"),
        }
        // The initial publish plus four failed re-publishes.
        assert_eq!(h.broker.publish_count(), MAX_RETRIES as usize);
        let s = h.metrics.snapshot();
        assert_eq!(s.pool_exhausted, u64::from(MAX_RETRIES - 1));
        assert_eq!((s.retried, s.dropped), (0, 1));
    }

    #[tokio::test]
    async fn initial_publish_failure_goes_to_the_caller() {
        let h = harness(vec![], Reply::Exhausted);

        let err = h.tracker.publish("ex", "rk", b"p".to_vec()).await.unwrap_err();
        assert!(err.is_infrastructure());
        assert!(h.store.is_empty());
        let s = h.metrics.snapshot();
        assert_eq!((s.pool_exhausted, s.published), (1, 0));
    }

    #[tokio::test]
    async fn store_outage_leaves_the_message_in_flight() {
        struct Down;

        #[async_trait]
        impl KvStore for Down {
            async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
                Err(StoreError::Unavailable("connection refused".into()))
            }
            async fn compare_and_set(
                &self,
                _: &str,
                _: Option<&str>,
                _: &str,
                _: Duration,
            ) -> Result<bool, StoreError> {
                Err(StoreError::Unavailable("connection refused".into()))
            }
            async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
                Err(StoreError::Unavailable("connection refused".into()))
            }
            async fn delete(&self, _: &str) -> Result<bool, StoreError> {
                Err(StoreError::Unavailable("connection refused".into()))
            }
            async fn put_fields(
                &self,
                _: &str,
                _: &std::collections::BTreeMap<String, String>,
                _: Duration,
            ) -> Result<(), StoreError> {
                Err(StoreError::Unavailable("connection refused".into()))
            }
            async fn get_fields(
                &self,
                _: &str,
            ) -> Result<Option<std::collections::BTreeMap<String, String>>, StoreError> {
                Err(StoreError::Unavailable("connection refused".into()))
            }
        }

        let (tx, mut events) = event_channel();
        let broker = Arc::new(InMemoryBroker::new(tx).with_fallback(Reply::Nack("busy".into())));
        let tracker = CorrelationTracker::new(
            broker.clone(),
            RetryCounters::new(Arc::new(Down), "publish:retry"),
            RetryPolicy::default(),
            Arc::new(Metrics::new()),
        );

        tracker.publish("ex", "rk", b"p".to_vec()).await.unwrap();
        let Some(BrokerEvent::Confirm(confirm)) = events.recv().await else {
            panic!("expected a confirm");
        };

        let err = tracker.on_confirm(confirm).await.unwrap_err();
        assert!(err.is_infrastructure());
        assert!(matches!(err, TrackerError::Store(StoreError::Unavailable(_))));
        // Neither re-published nor dropped.
        assert_eq!(broker.publish_count(), 1);
    }
}
