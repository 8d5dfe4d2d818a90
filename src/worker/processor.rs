use async_trait::async_trait;

use crate::codec::{CodecError, JsonCodec};
use crate::model::{InboundEnvelope, User};

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Decode(#[from] CodecError),
    #[error("processing failed: {0}")]
    Failed(String),
    #[error("processor panicked: {0}")]
    Panicked(String),
}

/// Business step applied to every delivery of the work queues.
///
/// `Ok` leads to an ack, any error (or panic) to a reject without requeue.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, envelope: &InboundEnvelope) -> Result<(), ProcessingError>;
}

/// Decode the payload as a [`User`] and log it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecodeAndLog {
    codec: JsonCodec,
}

#[async_trait]
impl MessageProcessor for DecodeAndLog {
    async fn process(&self, envelope: &InboundEnvelope) -> Result<(), ProcessingError> {
        let user: User = self.codec.decode(&envelope.payload)?;

        tracing::info!(
            delivery_tag = envelope.delivery_tag,
            routing_key = %envelope.routing_key,
            user_id = user.id,
            username = %user.username,
            "📥 user received"
        );
        Ok(())
    }
}

/// Fails every delivery. Used to push messages down the dead-letter path.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysFail;

#[async_trait]
impl MessageProcessor for AlwaysFail {
    async fn process(&self, envelope: &InboundEnvelope) -> Result<(), ProcessingError> {
        Err(ProcessingError::Failed(format!(
            "fault injection rejected delivery {}",
            envelope.delivery_tag
        )))
    }
}
