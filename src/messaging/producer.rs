use async_trait::async_trait;
use lapin::{
    message::BasicReturnMessage, options::BasicPublishOptions,
    publisher_confirm::Confirmation, BasicProperties,
};

use crate::model::OutboundEnvelope;

use super::rabbit::{headers_from_table, headers_to_table, ChannelPool};
use super::{BrokerEvent, ConfirmEvent, EventSender, PublishError, Publisher, ReturnEvent};

/// RabbitMQ [`Publisher`] with publisher confirms and the mandatory flag.
///
/// Each publish leases a confirm-mode channel from the [`ChannelPool`] only
/// for the `basic.publish` itself; the confirm is awaited on a spawned task
/// and forwarded as a [`BrokerEvent::Confirm`]. An unroutable message comes
/// back as a `basic.return` ahead of its ack and is forwarded as a
/// [`BrokerEvent::Return`] first.
///
/// Cloning is cheap: the pool and the event sender are both `Arc`-backed.
#[derive(Clone)]
pub struct RabbitPublisher {
    channels: ChannelPool,
    events: EventSender,
}

impl RabbitPublisher {
    pub fn new(channels: ChannelPool, events: EventSender) -> Self {
        Self { channels, events }
    }
}

#[async_trait]
impl Publisher for RabbitPublisher {
    async fn publish(&self, envelope: &OutboundEnvelope) -> Result<(), PublishError> {
        let correlation_id = envelope.correlation_id.as_str();

        let props = BasicProperties::default()
            .with_content_type(envelope.content_type.as_str().into())
            .with_delivery_mode(if envelope.persistent { 2 } else { 1 })
            .with_correlation_id(correlation_id.into())
            .with_message_id(correlation_id.into())
            .with_headers(headers_to_table(&envelope.headers()));

        let confirm = {
            let channel = self.channels.checkout().await?;
            channel
                .basic_publish(
                    &envelope.exchange,
                    &envelope.routing_key,
                    BasicPublishOptions {
                        mandatory: true,
                        ..Default::default()
                    },
                    &envelope.payload,
                    props,
                )
                .await
                .map_err(|e| PublishError::Publish(e.to_string()))?
            // lease returned to the cache here
        };

        tracing::debug!(
            correlation_id,
            exchange = %envelope.exchange,
            routing_key = %envelope.routing_key,
            "published, awaiting confirm"
        );

        let envelope = envelope.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            for event in confirm_events(envelope, confirm.await) {
                if events.send(event).await.is_err() {
                    tracing::warn!("broker event channel closed, confirm dropped");
                    break;
                }
            }
        });

        Ok(())
    }
}

/// Translate one lapin confirmation into pipeline events.
fn confirm_events(
    envelope: OutboundEnvelope,
    confirmation: lapin::Result<Confirmation>,
) -> Vec<BrokerEvent> {
    let mut events = Vec::with_capacity(2);

    let (accepted, reason) = match confirmation {
        Ok(Confirmation::Ack(returned)) => {
            events.extend(returned.map(|r| BrokerEvent::Return(return_event(*r))));
            (true, None)
        }
        Ok(Confirmation::Nack(returned)) => {
            events.extend(returned.map(|r| BrokerEvent::Return(return_event(*r))));
            (false, Some("broker nacked the publish".to_string()))
        }
        Ok(Confirmation::NotRequested) => {
            tracing::warn!(
                correlation_id = %envelope.correlation_id,
                "channel not in confirm mode, treating publish as confirmed"
            );
            (true, None)
        }
        // Channel or connection closed before the confirm arrived.
        Err(e) => (false, Some(e.to_string())),
    };

    events.push(BrokerEvent::Confirm(ConfirmEvent {
        envelope,
        accepted,
        reason,
    }));
    events
}

fn return_event(returned: BasicReturnMessage) -> ReturnEvent {
    let delivery = returned.delivery;
    ReturnEvent {
        headers: headers_from_table(delivery.properties.headers().as_ref()),
        correlation_property: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        payload: delivery.data,
        reply_code: returned.reply_code,
        reply_text: returned.reply_text.as_str().to_string(),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
    }
}
