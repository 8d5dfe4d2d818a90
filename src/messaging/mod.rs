//! Broker contract and its RabbitMQ / in-memory implementations.
//!
//! Broker callbacks are modelled as discrete [`BrokerEvent`]s sent over a
//! bounded channel; whoever owns the receiving end decides how to react.

mod consumer;
mod memory;
mod producer;
mod rabbit;
mod topology;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::{Headers, InboundEnvelope, OutboundEnvelope};

pub use consumer::{AckMode, ConsumerError, RabbitConsumer};
pub use memory::{InMemoryBroker, Reply};
pub use producer::RabbitPublisher;
pub use rabbit::{
    headers_from_table, headers_to_table, ChannelLease, ChannelPool, CheckoutGate, PoolError,
    CHANNEL_CACHE_SIZE, CHANNEL_CHECKOUT_TIMEOUT,
};
pub use topology::{declare_topology, Route, Topology, TopologyError};

/// Capacity of the broker event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

// ── Events ─────────────────────────────────────────────────────────────────────

/// Outcome of one publish attempt as reported by the broker.
///
/// Carries the envelope back so a retry can re-publish it unchanged.
#[derive(Debug, Clone)]
pub struct ConfirmEvent {
    pub envelope: OutboundEnvelope,
    pub accepted: bool,
    /// Why the broker refused the message, when it says.
    pub reason: Option<String>,
}

/// A published message the broker could not route to any queue.
#[derive(Debug, Clone)]
pub struct ReturnEvent {
    pub payload: Vec<u8>,
    pub headers: Headers,
    /// AMQP `correlation-id` property, when present.
    pub correlation_property: Option<String>,
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Confirm(ConfirmEvent),
    Return(ReturnEvent),
}

pub type EventSender = mpsc::Sender<BrokerEvent>;
pub type EventReceiver = mpsc::Receiver<BrokerEvent>;

/// Bounded broker event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

// ── Publishing ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("publish failed: {0}")]
    Publish(String),
}

impl PublishError {
    /// `true` when the channel pool ran dry within the checkout timeout.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::Pool(PoolError::ResourceExhausted { .. }))
    }
}

/// Publish side of the broker.
///
/// `publish` returns once the broker has the message; the confirm (and a
/// return, if the message was unroutable) arrives later as a
/// [`BrokerEvent`].
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, envelope: &OutboundEnvelope) -> Result<(), PublishError>;
}

// ── Consuming ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("acknowledgement failed: {0}")]
pub struct AckError(pub String);

/// Settles exactly one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positive acknowledgement. `multiple = true` would also settle every
    /// earlier outstanding delivery on the channel.
    async fn ack(&self, multiple: bool) -> Result<(), AckError>;

    /// Negative acknowledgement. With `requeue = false` the broker discards
    /// the message or forwards it to the queue's dead-letter exchange.
    async fn reject(&self, requeue: bool) -> Result<(), AckError>;
}

/// A delivery pulled from a queue.
///
/// `acker` is `None` for auto-ack subscriptions, where the broker considered
/// the message consumed on receipt.
pub struct Delivery {
    pub envelope: InboundEnvelope,
    pub acker: Option<Box<dyn Acknowledger>>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}
