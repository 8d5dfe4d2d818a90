use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery as LapinDelivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions},
    types::FieldTable,
    Channel, Consumer as LapinConsumer,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::InboundEnvelope;

use super::rabbit::{headers_from_table, ChannelPool};
use super::{AckError, Acknowledger, Delivery};

// ── Error ──────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("consumer channel error: {0}")]
    Channel(String),
    #[error("QoS setup failed: {0}")]
    Qos(String),
    #[error("failed to start consuming '{queue}': {message}")]
    Start { queue: String, message: String },
}

/// Who settles deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The consumer acks or rejects every delivery itself.
    Manual,
    /// The broker considers a delivery consumed as soon as it is sent.
    Auto,
}

// ── RabbitConsumer ─────────────────────────────────────────────────────────────

/// Subscription to one queue on a dedicated channel.
///
/// `prefetch` bounds the unsettled deliveries the broker pushes to this
/// channel (`basic.qos`, per consumer). In [`AckMode::Auto`] the limit does
/// not apply since nothing is ever outstanding.
pub struct RabbitConsumer {
    channel: Channel,
    queue: String,
    consumer_tag: String,
    mode: AckMode,
}

impl RabbitConsumer {
    pub async fn new(
        pool: &ChannelPool,
        queue: &str,
        prefetch: u16,
        mode: AckMode,
    ) -> Result<Self, ConsumerError> {
        let channel = pool
            .open_dedicated()
            .await
            .map_err(|e| ConsumerError::Channel(e.to_string()))?;

        if mode == AckMode::Manual {
            channel
                .basic_qos(prefetch, BasicQosOptions { global: false })
                .await
                .map_err(|e| ConsumerError::Qos(e.to_string()))?;
        }

        Ok(Self {
            channel,
            queue: queue.to_string(),
            consumer_tag: format!("{queue}_{}", Uuid::new_v4()),
            mode,
        })
    }

    /// Start consuming and forward every delivery to `tx`.
    ///
    /// Several consumers may share one `tx`; the receiving side then sees
    /// their queues as a single stream. The forwarding task stops when the
    /// broker cancels the consumer or `tx`'s receiver is dropped.
    pub async fn start(self, tx: mpsc::Sender<Delivery>) -> Result<(), ConsumerError> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: self.mode == AckMode::Auto,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Start {
                queue: self.queue.clone(),
                message: e.to_string(),
            })?;

        tracing::info!(
            queue = %self.queue,
            consumer_tag = %self.consumer_tag,
            mode = ?self.mode,
            "▶️  consuming"
        );

        // The lapin consumer holds the channel alive for the task's lifetime.
        tokio::spawn(consume_loop(consumer, self.consumer_tag, self.mode, tx));
        Ok(())
    }
}

// ── Background task ────────────────────────────────────────────────────────────

async fn consume_loop(
    mut consumer: LapinConsumer,
    consumer_tag: String,
    mode: AckMode,
    tx: mpsc::Sender<Delivery>,
) {
    while let Some(result) = consumer.next().await {
        let delivery = match result {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(consumer_tag = %consumer_tag, error = %e, "consumer stream error");
                break;
            }
        };

        if tx.send(convert(delivery, &consumer_tag, mode)).await.is_err() {
            // Receiver dropped: shutting down. Unacked deliveries go back to
            // the queue when the channel closes.
            break;
        }
    }

    tracing::debug!(consumer_tag = %consumer_tag, "consume loop finished");
}

fn convert(delivery: LapinDelivery, consumer_tag: &str, mode: AckMode) -> Delivery {
    let envelope = InboundEnvelope {
        delivery_tag: delivery.delivery_tag,
        consumer_tag: consumer_tag.to_string(),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        headers: headers_from_table(delivery.properties.headers().as_ref()),
        payload: delivery.data,
    };

    let acker: Option<Box<dyn Acknowledger>> = match mode {
        AckMode::Manual => Some(Box::new(LapinAcker(delivery.acker))),
        AckMode::Auto => None,
    };

    Delivery { envelope, acker }
}

/// [`Acknowledger`] over lapin's per-delivery acker.
struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, multiple: bool) -> Result<(), AckError> {
        self.0
            .ack(BasicAckOptions { multiple })
            .await
            .map_err(|e| AckError(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), AckError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| AckError(e.to_string()))
    }
}
