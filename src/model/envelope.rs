use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// AMQP header carrying the correlation id of an outbound message.
///
/// Also set as the `correlation-id` message property; the header survives
/// the broker's `basic.return` path, which is where the return handler
/// needs it.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// String-valued message headers.
///
/// AMQP headers are typed; only the scalar ones are carried over (see
/// `messaging::rabbit::headers_from_table`).
pub type Headers = BTreeMap<String, String>;

// ── CorrelationId ──────────────────────────────────────────────────────────────

/// Identifier linking one logical outbound message to its confirm / return
/// events and to its retry counter.
///
/// Generated once per logical message and reused for every retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random (v4) id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Placeholder id for a returned message whose headers lost the
    /// correlation id.
    pub fn unattributed() -> Self {
        Self(format!("unattributed-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ── OutboundEnvelope ───────────────────────────────────────────────────────────

/// A message on its way to the broker.
///
/// Created by the correlation tracker at publish time. The envelope travels
/// with its confirm event back to the tracker, so a retry re-publishes the
/// exact same exchange, routing key, payload and correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub correlation_id: CorrelationId,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// Delivery mode 2 when `true`.
    pub persistent: bool,
    pub content_type: String,
}

impl OutboundEnvelope {
    /// Persistent envelope with a fresh correlation id.
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            persistent: true,
            content_type: content_type.into(),
        }
    }

    /// Headers attached to every publish of this envelope.
    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(
            CORRELATION_HEADER.to_string(),
            self.correlation_id.to_string(),
        );
        headers
    }
}

// ── InboundEnvelope ────────────────────────────────────────────────────────────

/// A single delivery handed to a consumer.
///
/// `delivery_tag` is channel-scoped and only meaningful for the ack/reject of
/// this delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl InboundEnvelope {
    /// Correlation id stamped by the publisher, if the header survived.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.headers
            .get(CORRELATION_HEADER)
            .filter(|v| !v.is_empty())
            .map(|v| CorrelationId::from(v.as_str()))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}
