use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};

use super::CorrelationId;

/// Bookkeeping entry for a message the broker handed back as unroutable.
///
/// Persisted as a hash in the key-value store for manual or batch
/// inspection; nothing in this crate resubmits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnRecord {
    pub correlation_id: CorrelationId,
    /// `false` when the returned message carried no correlation id and
    /// `correlation_id` is a generated placeholder.
    pub attributed: bool,
    pub exchange: String,
    pub routing_key: String,
    /// Raw payload of the returned message.
    pub message: Vec<u8>,
    pub reply_code: u16,
    /// Broker reply text, e.g. `NO_ROUTE`.
    pub error_detail: String,
    pub returned_at: DateTime<Utc>,
}

impl ReturnRecord {
    /// Flatten into store fields. The payload is base64 encoded.
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("correlation_id".to_string(), self.correlation_id.to_string()),
            ("attributed".to_string(), self.attributed.to_string()),
            ("exchange".to_string(), self.exchange.clone()),
            ("routing_key".to_string(), self.routing_key.clone()),
            ("message".to_string(), STANDARD.encode(&self.message)),
            ("reply_code".to_string(), self.reply_code.to_string()),
            ("error_detail".to_string(), self.error_detail.clone()),
            ("returned_at".to_string(), self.returned_at.to_rfc3339()),
        ])
    }

    /// Rebuild from store fields. Returns `None` when a field is missing or
    /// malformed.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Option<Self> {
        let get = |name: &str| fields.get(name).cloned();

        Some(Self {
            correlation_id: CorrelationId::from(get("correlation_id")?),
            attributed: get("attributed")?.parse().ok()?,
            exchange: get("exchange")?,
            routing_key: get("routing_key")?,
            message: STANDARD.decode(get("message")?).ok()?,
            reply_code: get("reply_code")?.parse().ok()?,
            error_detail: get("error_detail")?,
            returned_at: DateTime::parse_from_rfc3339(&get("returned_at")?)
                .ok()?
                .with_timezone(&Utc),
        })
    }
}
