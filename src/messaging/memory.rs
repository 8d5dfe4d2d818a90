use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::{Headers, OutboundEnvelope};

use super::{
    BrokerEvent, ConfirmEvent, EventSender, PoolError, PublishError, Publisher, ReturnEvent,
};

/// How the in-memory broker answers one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Confirm the publish.
    Ack,
    /// Refuse the publish with the given reason.
    Nack(String),
    /// Accept but fail to route: a return followed by a positive confirm.
    Unroutable { reply_code: u16, reply_text: String },
    /// Fail the publish call itself, as if no channel could be leased.
    Exhausted,
}

impl Reply {
    /// `312 NO_ROUTE`, what RabbitMQ answers for a mandatory publish that
    /// matched no binding.
    pub fn no_route() -> Self {
        Self::Unroutable {
            reply_code: 312,
            reply_text: "NO_ROUTE".to_string(),
        }
    }
}

/// Scripted [`Publisher`] that records every publish and answers with
/// broker events on the same channel the RabbitMQ publisher uses.
///
/// Replies are taken from the script in order; once it runs out, the
/// fallback reply is used for every further publish.
pub struct InMemoryBroker {
    events: EventSender,
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    strip_headers: bool,
    published: Mutex<Vec<OutboundEnvelope>>,
}

impl InMemoryBroker {
    /// Broker that confirms everything.
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            script: Mutex::new(VecDeque::new()),
            fallback: Reply::Ack,
            strip_headers: false,
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        *self.script.lock().unwrap_or_else(|p| p.into_inner()) = replies.into_iter().collect();
        self
    }

    pub fn with_fallback(mut self, reply: Reply) -> Self {
        self.fallback = reply;
        self
    }

    /// Drop all headers from returned messages, as an intermediary that
    /// rewrites properties would.
    pub fn stripping_headers(mut self) -> Self {
        self.strip_headers = true;
        self
    }

    /// Every envelope passed to `publish`, in call order, including calls
    /// answered with [`Reply::Exhausted`].
    pub fn published(&self) -> Vec<OutboundEnvelope> {
        self.published.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn next_reply(&self) -> Reply {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    async fn emit(&self, event: BrokerEvent) -> Result<(), PublishError> {
        self.events
            .send(event)
            .await
            .map_err(|_| PublishError::Publish("broker event channel closed".to_string()))
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, envelope: &OutboundEnvelope) -> Result<(), PublishError> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(envelope.clone());

        let confirm = |accepted: bool, reason: Option<String>| {
            BrokerEvent::Confirm(ConfirmEvent {
                envelope: envelope.clone(),
                accepted,
                reason,
            })
        };

        match self.next_reply() {
            Reply::Ack => self.emit(confirm(true, None)).await,
            Reply::Nack(reason) => self.emit(confirm(false, Some(reason))).await,
            Reply::Unroutable { reply_code, reply_text } => {
                let (headers, correlation_property) = if self.strip_headers {
                    (Headers::new(), None)
                } else {
                    (envelope.headers(), Some(envelope.correlation_id.to_string()))
                };
                self.emit(BrokerEvent::Return(ReturnEvent {
                    payload: envelope.payload.clone(),
                    headers,
                    correlation_property,
                    reply_code,
                    reply_text,
                    exchange: envelope.exchange.clone(),
                    routing_key: envelope.routing_key.clone(),
                }))
                .await?;
                self.emit(confirm(true, None)).await
            }
            Reply::Exhausted => Err(PoolError::ResourceExhausted {
                waited: Duration::ZERO,
                capacity: 0,
            }
            .into()),
        }
    }
}
