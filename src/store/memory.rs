use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{KvStore, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    Map(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local [`KvStore`].
///
/// Expiry is evaluated lazily against the tokio clock, so tests running with
/// a paused clock can advance past a TTL deterministically.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of a live key, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned map is still structurally valid.
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Live entry under `key`, purging it first if it has expired.
    fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if map.get(key).is_some_and(|e| !e.is_live(now)) {
            map.remove(key);
        }
        map.get_mut(key)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        detail: "operation against a key holding the wrong kind of value".to_string(),
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            None => Ok(None),
            Some(Entry { value: Value::Scalar(v), .. }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut map = self.lock();
        let expires_at = Some(Instant::now() + ttl);
        match (Self::live(&mut map, key), expected) {
            (None, None) => {
                map.insert(
                    key.to_string(),
                    Entry { value: Value::Scalar(new.to_string()), expires_at },
                );
                Ok(true)
            }
            (Some(entry), Some(expected)) => match &entry.value {
                Value::Scalar(current) if current == expected => {
                    entry.value = Value::Scalar(new.to_string());
                    entry.expires_at = expires_at;
                    Ok(true)
                }
                Value::Scalar(_) => Ok(false),
                Value::Map(_) => Err(wrong_type(key)),
            },
            _ => Ok(false),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut map = self.lock();
        Ok(match Self::live(&mut map, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut map = self.lock();
        let existed = Self::live(&mut map, key).is_some();
        map.remove(key);
        Ok(existed)
    }

    async fn put_fields(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut map = self.lock();
        if let Some(Entry { value: Value::Scalar(_), .. }) = Self::live(&mut map, key) {
            return Err(wrong_type(key));
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Map(fields.clone()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get_fields(
        &self,
        key: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        let mut map = self.lock();
        match Self::live(&mut map, key) {
            None => Ok(None),
            Some(Entry { value: Value::Map(fields), .. }) => Ok(Some(fields.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }
}
