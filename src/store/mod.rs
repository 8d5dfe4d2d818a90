//! Key-value store used for retry counters and return records.
//!
//! The store is the only shared mutable state of the pipeline. Scalar keys
//! are mutated through [`KvStore::compare_and_set`] only; map keys are
//! written whole by [`KvStore::put_fields`].

mod memory;
mod redis;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

// ── Error ──────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A single store call exceeded its time budget.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    /// Compare-and-set lost the race too many times in a row.
    #[error("compare-and-set on '{key}' lost {attempts} consecutive races")]
    Contention { key: String, attempts: u32 },
    /// A stored value did not have the expected shape.
    #[error("corrupt value under '{key}': {detail}")]
    Corrupt { key: String, detail: String },
}

impl StoreError {
    /// `true` for failures of the store itself rather than of the data in it.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

// ── Contract ───────────────────────────────────────────────────────────────────

/// Minimal key-value contract.
///
/// Keys are opaque strings; scalar values are strings (counters are decimal
/// integers), map values are string-to-string hashes.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomically replace the value under `key` with `new` if the current
    /// value equals `expected` (`None` = key absent), and set its TTL in the
    /// same step. A swapped key always carries an expiry. Returns whether the
    /// swap happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Set the time-to-live of an existing key. Returns `false` if the key
    /// does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remove `key`. Returns whether something was deleted; deleting an
    /// absent key is not an error.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Write every field of a map key and set its TTL in one step.
    async fn put_fields(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Read a map key. `None` when the key is absent.
    async fn get_fields(&self, key: &str)
        -> Result<Option<BTreeMap<String, String>>, StoreError>;
}

/// Build a namespaced key: `<namespace>::<id>`.
pub fn namespaced(namespace: &str, id: impl std::fmt::Display) -> String {
    format!("{namespace}::{id}")
}
