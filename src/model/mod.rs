mod envelope;
mod record;
mod user;

pub use envelope::{CorrelationId, Headers, InboundEnvelope, OutboundEnvelope, CORRELATION_HEADER};
pub use record::ReturnRecord;
pub use user::User;
