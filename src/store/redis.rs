use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{KvStore, StoreError};

/// GET-compare-SET in one round trip. The expiry is written by the same
/// `SET`, so a swapped key is never left without a TTL.
///
/// ARGV[1] = "1" when a current value is expected, "0" when the key must be
/// absent; ARGV[2] = expected value; ARGV[3] = new value; ARGV[4] = TTL in ms.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
  if current then return 0 end
elseif current ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

/// Redis-backed [`KvStore`].
///
/// Uses a [`ConnectionManager`] so dropped connections are re-established
/// transparently. Every command is bounded by `op_timeout`; a call that
/// exceeds it fails with [`StoreError::Timeout`] instead of hanging the
/// confirm path.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    cas: redis::Script,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect to `url` (`redis://` or `rediss://`).
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(op_timeout))?
            .map_err(unavailable)?;

        tracing::info!("🗄️  Redis connected");

        Ok(Self {
            conn,
            cas: redis::Script::new(COMPARE_AND_SET),
            op_timeout,
        })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.op_timeout))?
            .map_err(unavailable)
    }
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(conn.get::<_, Option<String>>(key)).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.cas.key(key);
        invocation
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(new)
            .arg(millis(ttl));

        let swapped: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(swapped == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(conn.pexpire::<_, bool>(key, millis(ttl))).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self.bounded(conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn put_fields(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(key)
            .ignore()
            .hset_multiple(key, &items)
            .ignore()
            .pexpire(key, millis(ttl))
            .ignore();

        let () = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn get_fields(
        &self,
        key: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = self.bounded(conn.hgetall(key)).await?;
        Ok((!fields.is_empty()).then(|| fields.into_iter().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running Redis instance:
    //   docker run -d -p 6379:6379 redis:7

    async fn store() -> RedisStore {
        RedisStore::connect("redis://localhost:6379", Duration::from_secs(2))
            .await
            .expect("redis")
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn compare_and_set_script() {
        let store = store().await;
        let key = format!("ackline:test:{}", uuid::Uuid::new_v4());

        let ttl = Duration::from_secs(10);

        assert!(store.compare_and_set(&key, None, "1", ttl).await.unwrap());
        assert!(!store.compare_and_set(&key, None, "1", ttl).await.unwrap());
        assert!(!store.compare_and_set(&key, Some("5"), "6", ttl).await.unwrap());
        assert!(store.compare_and_set(&key, Some("1"), "2", ttl).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("2"));

        let mut conn = store.conn.clone();
        let pttl: i64 = conn.pttl(&key).await.unwrap();
        assert!(pttl > 0 && pttl <= 10_000, "swap must leave an expiry, got {pttl}");
        assert!(store.expire(&key, Duration::from_secs(30)).await.unwrap());

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn map_fields_with_expiry() {
        let store = store().await;
        let key = format!("ackline:test:{}", uuid::Uuid::new_v4());
        let fields = BTreeMap::from([
            ("exchange".to_string(), "ex".to_string()),
            ("routing_key".to_string(), "rk".to_string()),
        ]);

        store.put_fields(&key, &fields, Duration::from_secs(30)).await.unwrap();
        assert_eq!(store.get_fields(&key).await.unwrap(), Some(fields));

        let narrower = BTreeMap::from([("exchange".to_string(), "other".to_string())]);
        store.put_fields(&key, &narrower, Duration::from_secs(30)).await.unwrap();
        assert_eq!(store.get_fields(&key).await.unwrap(), Some(narrower));

        store.delete(&key).await.unwrap();
        assert_eq!(store.get_fields(&key).await.unwrap(), None);
    }
}
