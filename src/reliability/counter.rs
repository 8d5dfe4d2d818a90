use std::sync::Arc;
use std::time::Duration;

use crate::model::CorrelationId;
use crate::store::{namespaced, KvStore, StoreError};

/// Default TTL of a retry counter. Refreshed on every update.
pub const COUNTER_TTL: Duration = Duration::from_secs(10);

/// Default bound on read/compare-and-set cycles per update.
pub const MAX_CAS_ATTEMPTS: u32 = 16;

/// Per-message publish-failure counters.
///
/// The only component that touches retry state in the store. Counters live
/// under `<namespace>::<correlation id>` and only ever move through a
/// successful compare-and-set, so concurrent failures for the same id never
/// lose an update and the value never decreases.
#[derive(Clone)]
pub struct RetryCounters {
    store: Arc<dyn KvStore>,
    namespace: String,
    ttl: Duration,
    max_cas_attempts: u32,
}

impl RetryCounters {
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            ttl: COUNTER_TTL,
            max_cas_attempts: MAX_CAS_ATTEMPTS,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    pub fn key(&self, id: &CorrelationId) -> String {
        namespaced(&self.namespace, id)
    }

    /// Current failure count, `None` when no counter exists.
    pub async fn current(&self, id: &CorrelationId) -> Result<Option<u32>, StoreError> {
        let key = self.key(id);
        self.read(&key).await
    }

    /// Record one more failed publish and return the new count.
    ///
    /// Absent → 1, `n` → `n + 1`. The swap writes the TTL with the value, so a
    /// counter is never left without an expiry.
    pub async fn record_failure(&self, id: &CorrelationId) -> Result<u32, StoreError> {
        let key = self.key(id);

        for _ in 0..self.max_cas_attempts {
            let current = self.read(&key).await?;
            let next = current.map_or(1, |n| n.saturating_add(1));

            let expected = current.map(|n| n.to_string());
            let swapped = self
                .store
                .compare_and_set(&key, expected.as_deref(), &next.to_string(), self.ttl)
                .await?;

            if swapped {
                return Ok(next);
            }

            tracing::debug!(key = %key, "retry counter changed underneath us, re-reading");
        }

        Err(StoreError::Contention {
            key,
            attempts: self.max_cas_attempts,
        })
    }

    /// Remove the counter. Removing an absent counter is a no-op.
    pub async fn clear(&self, id: &CorrelationId) -> Result<(), StoreError> {
        self.store.delete(&self.key(id)).await?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<u32>, StoreError> {
        match self.store.get(key).await? {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<u32>().map(Some).map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                detail: format!("{raw:?} is not a counter: {e}"),
            }),
        }
    }
}
