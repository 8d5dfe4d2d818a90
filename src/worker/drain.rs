use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::codec::JsonCodec;
use crate::messaging::Delivery;
use crate::metrics::Metrics;
use crate::model::{CorrelationId, User};

use super::pool::DeliveryHandler;

/// Dead letters kept in the journal by default.
pub const JOURNAL_CAPACITY: usize = 256;

const DEATH_REASON_HEADER: &str = "x-first-death-reason";
const DEATH_QUEUE_HEADER: &str = "x-first-death-queue";

/// One message seen on the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub delivery_tag: u64,
    pub routing_key: String,
    /// Publisher's correlation id, when the header survived dead-lettering.
    pub correlation_id: Option<CorrelationId>,
    /// Why the broker dead-lettered it (`rejected`, `expired`, ...).
    pub reason: Option<String>,
    /// Queue the message was dead-lettered from.
    pub original_queue: Option<String>,
    /// Decoded payload, `None` when it is not a [`User`].
    pub user: Option<User>,
    pub payload_len: usize,
    pub received_at: DateTime<Utc>,
}

/// Terminal handler of the dead-letter queue.
///
/// Deliveries arrive auto-acked; the drain only logs them and keeps the most
/// recent ones in a bounded in-memory journal. Nothing is retried or
/// re-published.
pub struct DeadLetterDrain {
    codec: JsonCodec,
    journal: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl DeadLetterDrain {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self::with_capacity(JOURNAL_CAPACITY, metrics)
    }

    pub fn with_capacity(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            codec: JsonCodec,
            journal: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            metrics,
        }
    }

    /// Journal contents, oldest first.
    pub fn recent(&self) -> Vec<DeadLetter> {
        self.journal().iter().cloned().collect()
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, VecDeque<DeadLetter>> {
        self.journal.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn remember(&self, letter: DeadLetter) {
        if self.capacity == 0 {
            return;
        }
        let mut journal = self.journal();
        if journal.len() == self.capacity {
            journal.pop_front();
        }
        journal.push_back(letter);
    }
}

#[async_trait]
impl DeliveryHandler for DeadLetterDrain {
    async fn handle(&self, worker: usize, delivery: Delivery) {
        let envelope = delivery.envelope;

        let user = match self.codec.decode::<User>(&envelope.payload) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::debug!(worker, delivery_tag = envelope.delivery_tag, error = %e, "dead letter is not a user");
                None
            }
        };

        let letter = DeadLetter {
            delivery_tag: envelope.delivery_tag,
            routing_key: envelope.routing_key.clone(),
            correlation_id: envelope.correlation_id(),
            reason: envelope.header(DEATH_REASON_HEADER).map(str::to_string),
            original_queue: envelope.header(DEATH_QUEUE_HEADER).map(str::to_string),
            user,
            payload_len: envelope.payload.len(),
            received_at: Utc::now(),
        };

        tracing::warn!(
            worker,
            delivery_tag = letter.delivery_tag,
            correlation_id = letter.correlation_id.as_ref().map(|c| c.as_str()),
            reason = letter.reason.as_deref().unwrap_or("unknown"),
            queue = letter.original_queue.as_deref().unwrap_or("unknown"),
            user_id = letter.user.as_ref().map(|u| u.id),
            bytes = letter.payload_len,
            "☠️  dead letter drained"
        );

        self.metrics.inc_dead_lettered();
        self.remember(letter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Headers, InboundEnvelope};

    fn delivery(tag: u64, payload: &[u8], headers: Headers) -> Delivery {
        Delivery {
            envelope: InboundEnvelope {
                delivery_tag: tag,
                consumer_tag: "dead".into(),
                exchange: "dead_exchange".into(),
                routing_key: "dead".into(),
                redelivered: false,
                payload: payload.to_vec(),
                headers,
            },
            acker: None,
        }
    }

    #[tokio::test]
    async fn records_reason_and_payload() {
        let metrics = Arc::new(Metrics::new());
        let drain = DeadLetterDrain::new(metrics.clone());
        let headers = Headers::from([
            (DEATH_REASON_HEADER.to_string(), "rejected".to_string()),
            (DEATH_QUEUE_HEADER.to_string(), "order_queue".to_string()),
            ("x-correlation-id".to_string(), "abc-123".to_string()),
        ]);

        drain
            .handle(0, delivery(1, br#"{"id":9,"username":"bo","email":"bo@example.com"}"#, headers))
            .await;

        let recent = drain.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].reason.as_deref(), Some("rejected"));
        assert_eq!(recent[0].original_queue.as_deref(), Some("order_queue"));
        assert_eq!(recent[0].user.as_ref().map(|u| u.id), Some(9));
        assert_eq!(recent[0].correlation_id, Some(CorrelationId::from("abc-123")));
        assert_eq!(metrics.snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn undecodable_payloads_are_still_journaled() {
        let drain = DeadLetterDrain::new(Arc::new(Metrics::new()));

        drain.handle(0, delivery(1, b"???", Headers::new())).await;

        let recent = drain.recent();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].user.is_none());
        assert!(recent[0].reason.is_none());
        assert!(recent[0].correlation_id.is_none());
    }

    #[tokio::test]
    async fn journal_keeps_the_newest() {
        let drain = DeadLetterDrain::with_capacity(2, Arc::new(Metrics::new()));

        for tag in 1..=3 {
            drain.handle(0, delivery(tag, b"x", Headers::new())).await;
        }

        let tags: Vec<_> = drain.recent().iter().map(|l| l.delivery_tag).collect();
        assert_eq!(tags, vec![2, 3]);
    }
}
