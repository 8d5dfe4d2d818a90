use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::messaging::ReturnEvent;
use crate::metrics::Metrics;
use crate::model::{CorrelationId, ReturnRecord, CORRELATION_HEADER};
use crate::store::{namespaced, KvStore, StoreError};

/// How long a return record is kept for inspection.
pub const RETURN_RECORD_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Persists unroutable messages as [`ReturnRecord`]s.
///
/// A return is never retried: it is stored once and left for an operator.
/// The record is keyed by the message's correlation id, taken from the
/// `x-correlation-id` header and then from the `correlation-id` property.
/// When both are gone a fresh `unattributed-*` id is used so the record is
/// still written.
pub struct ReturnHandler {
    store: Arc<dyn KvStore>,
    namespace: String,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl ReturnHandler {
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            ttl: RETURN_RECORD_TTL,
            metrics,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn key(&self, id: &CorrelationId) -> String {
        namespaced(&self.namespace, id)
    }

    pub async fn on_return(&self, event: ReturnEvent) -> Result<ReturnRecord, StoreError> {
        let found = event
            .headers
            .get(CORRELATION_HEADER)
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| event.correlation_property.filter(|v| !v.is_empty()));

        let attributed = found.is_some();
        let correlation_id = found.map(CorrelationId::from).unwrap_or_else(CorrelationId::unattributed);

        let record = ReturnRecord {
            correlation_id,
            attributed,
            exchange: event.exchange,
            routing_key: event.routing_key,
            message: event.payload,
            reply_code: event.reply_code,
            error_detail: event.reply_text,
            returned_at: Utc::now(),
        };

        if attributed {
            tracing::warn!(
                correlation_id = %record.correlation_id,
                exchange = %record.exchange,
                routing_key = %record.routing_key,
                reply_code = record.reply_code,
                reply_text = %record.error_detail,
                bytes = record.message.len(),
                "↩️  message returned as unroutable"
            );
        } else {
            tracing::warn!(
                placeholder = %record.correlation_id,
                exchange = %record.exchange,
                routing_key = %record.routing_key,
                reply_code = record.reply_code,
                "↩️  unroutable message returned without a correlation id"
            );
        }

        self.store
            .put_fields(&self.key(&record.correlation_id), &record.to_fields(), self.ttl)
            .await?;
        self.metrics.inc_returned();

        Ok(record)
    }

    /// Fetch a stored return record.
    pub async fn lookup(&self, id: &CorrelationId) -> Result<Option<ReturnRecord>, StoreError> {
        let key = self.key(id);
        let Some(fields) = self.store.get_fields(&key).await? else {
            return Ok(None);
        };

        ReturnRecord::from_fields(&fields)
            .map(Some)
            .ok_or_else(|| StoreError::Corrupt {
                key,
                detail: "incomplete return record".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Headers;
    use crate::store::InMemoryStore;

    fn event(headers: Headers, property: Option<&str>) -> ReturnEvent {
        ReturnEvent {
            payload: br#"{"id":1}"#.to_vec(),
            headers,
            correlation_property: property.map(str::to_string),
            reply_code: 312,
            reply_text: "NO_ROUTE".into(),
            exchange: "order_exchange".into(),
            routing_key: "nowhere".into(),
        }
    }

    fn handler() -> (Arc<InMemoryStore>, Arc<Metrics>, ReturnHandler) {
        let store = Arc::new(InMemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let handler = ReturnHandler::new(store.clone(), "publish:return", metrics.clone());
        (store, metrics, handler)
    }

    #[tokio::test(start_paused = true)]
    async fn header_id_keys_the_record() {
        let (store, metrics, handler) = handler();
        let headers = Headers::from([(CORRELATION_HEADER.to_string(), "abc".to_string())]);

        let record = handler.on_return(event(headers, Some("ignored"))).await.unwrap();

        assert!(record.attributed);
        assert_eq!(record.correlation_id.as_str(), "abc");
        assert_eq!(store.ttl("publish:return::abc"), Some(RETURN_RECORD_TTL));
        assert_eq!(metrics.snapshot().returned, 1);

        let stored = handler.lookup(&record.correlation_id).await.unwrap().unwrap();
        assert_eq!(stored.message, br#"{"id":1}"#);
        assert_eq!(stored.reply_code, 312);
        assert_eq!(stored.error_detail, "NO_ROUTE");
    }

    #[tokio::test]
    async fn falls_back_to_the_property() {
        let (_, _, handler) = handler();

        let record = handler.on_return(event(Headers::new(), Some("prop-id"))).await.unwrap();

        assert!(record.attributed);
        assert_eq!(record.correlation_id.as_str(), "prop-id");
    }

    #[tokio::test]
    async fn missing_id_gets_a_placeholder() {
        let (store, _, handler) = handler();

        let first = handler.on_return(event(Headers::new(), None)).await.unwrap();
        let second = handler.on_return(event(Headers::new(), Some(""))).await.unwrap();

        assert!(!first.attributed);
        assert!(first.correlation_id.as_str().starts_with("unattributed-"));
        assert_ne!(first.correlation_id, second.correlation_id);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn unknown_id_is_none() {
        let (_, _, handler) = handler();
        assert!(handler.lookup(&CorrelationId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn incomplete_record_is_corrupt() {
        let (store, _, handler) = handler();
        let id = CorrelationId::from("broken");
        store
            .put_fields(
                &handler.key(&id),
                &std::collections::BTreeMap::from([("exchange".to_string(), "x".to_string())]),
                RETURN_RECORD_TTL,
            )
            .await
            .unwrap();

        let err = handler.lookup(&id).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
