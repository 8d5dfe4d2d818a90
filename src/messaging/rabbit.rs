use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use deadpool_lapin::Manager;
use lapin::options::ConfirmSelectOptions;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ConnectionProperties};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::model::Headers;

/// Upper bound on channels leased at the same time.
pub const CHANNEL_CACHE_SIZE: usize = 25;

/// How long a publisher waits for a free channel before giving up.
pub const CHANNEL_CHECKOUT_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Connections behind the channel cache: one for publishing, one for the
/// consumers.
const CONNECTIONS: usize = 2;

const MAX_CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

// ── Error ──────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Every channel was leased for the whole checkout timeout.
    #[error("no channel free within {waited:?} ({capacity} channels in use)")]
    ResourceExhausted { waited: Duration, capacity: usize },
    #[error("RabbitMQ connection failed: {0}")]
    Connection(String),
    #[error("channel open failed: {0}")]
    Channel(String),
    #[error("connection pool build failed: {0}")]
    Build(String),
}

// ── CheckoutGate ───────────────────────────────────────────────────────────────

/// Bounded admission to the channel cache: `capacity` leases at most, each
/// waiting no longer than `checkout_timeout` for a slot.
pub struct CheckoutGate {
    permits: Arc<Semaphore>,
    capacity: usize,
    checkout_timeout: Duration,
}

impl CheckoutGate {
    pub fn new(capacity: usize, checkout_timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            checkout_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn checkout_timeout(&self) -> Duration {
        self.checkout_timeout
    }

    /// Take a slot, or fail with [`PoolError::ResourceExhausted`] once the
    /// timeout has passed. The slot is freed when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        tokio::time::timeout(self.checkout_timeout, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| self.exhausted())?
            .map_err(|_| PoolError::Channel("channel pool closed".to_string()))
    }

    fn exhausted(&self) -> PoolError {
        PoolError::ResourceExhausted {
            waited: self.checkout_timeout,
            capacity: self.capacity,
        }
    }
}

// ── ChannelPool ────────────────────────────────────────────────────────────────

struct Inner {
    connections: deadpool_lapin::Pool,
    idle: Mutex<Vec<Channel>>,
    gate: CheckoutGate,
}

/// Cache of publisher-confirm channels over a [`deadpool_lapin`] connection
/// pool.
///
/// At most `capacity` channels are leased at once. A checkout waits for a
/// free slot for at most `checkout_timeout` and then fails with
/// [`PoolError::ResourceExhausted`]; it never queues unboundedly. Returned
/// channels that are still open go back to the cache.
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<Inner>,
}

impl ChannelPool {
    /// Build the pool and verify connectivity, retrying up to
    /// [`MAX_CONNECT_ATTEMPTS`] times [`CONNECT_RETRY_INTERVAL`] apart.
    pub async fn connect(
        url: &str,
        capacity: usize,
        checkout_timeout: Duration,
    ) -> Result<Self, PoolError> {
        let manager = Manager::new(url, ConnectionProperties::default());
        let connections = deadpool_lapin::Pool::builder(manager)
            .max_size(CONNECTIONS)
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))?;

        let mut attempt = 1;
        loop {
            match connections.get().await {
                Ok(_) => break,
                Err(e) if attempt >= MAX_CONNECT_ATTEMPTS => {
                    return Err(PoolError::Connection(format!(
                        "failed after {MAX_CONNECT_ATTEMPTS} attempts: {e}"
                    )));
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max = MAX_CONNECT_ATTEMPTS,
                        error = %e,
                        "⚠️  RabbitMQ not ready, retrying in {}s...",
                        CONNECT_RETRY_INTERVAL.as_secs()
                    );
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                    attempt += 1;
                }
            }
        }

        tracing::info!(
            capacity,
            checkout_timeout_ms = checkout_timeout.as_millis() as u64,
            "📡 RabbitMQ connected"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                connections,
                idle: Mutex::new(Vec::with_capacity(capacity)),
                gate: CheckoutGate::new(capacity, checkout_timeout),
            }),
        })
    }

    /// Lease a confirm-mode channel for publishing.
    pub async fn checkout(&self) -> Result<ChannelLease, PoolError> {
        let inner = &self.inner;
        let permit = inner.gate.acquire().await?;

        let cached = {
            let mut idle = inner.idle.lock().unwrap_or_else(|p| p.into_inner());
            idle.retain(|c| c.status().connected());
            idle.pop()
        };

        let channel = match cached {
            Some(channel) => channel,
            None => self.open_channel(true).await?,
        };

        Ok(ChannelLease {
            channel,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Open a long-lived channel outside the cache (consumers, topology).
    pub async fn open_dedicated(&self) -> Result<Channel, PoolError> {
        self.open_channel(false).await
    }

    async fn open_channel(&self, confirms: bool) -> Result<Channel, PoolError> {
        let gate = &self.inner.gate;
        let conn = tokio::time::timeout(gate.checkout_timeout(), self.inner.connections.get())
            .await
            .map_err(|_| gate.exhausted())?
            .map_err(|e| PoolError::Connection(e.to_string()))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| PoolError::Channel(e.to_string()))?;

        // conn (pool Object) drops here; the channel keeps the connection
        // alive.

        if confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| PoolError::Channel(format!("confirm.select: {e}")))?;
        }

        tracing::debug!(channel = channel.id(), confirms, "channel opened");
        Ok(channel)
    }
}

/// A leased channel. Dropping the lease returns the channel to the cache.
pub struct ChannelLease {
    channel: Channel,
    pool: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for ChannelLease {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        // lapin channels are Arc-backed; the clone is the same channel.
        if self.channel.status().connected() {
            let mut idle = self.pool.idle.lock().unwrap_or_else(|p| p.into_inner());
            idle.push(self.channel.clone());
        }
    }
}

// ── Headers ────────────────────────────────────────────────────────────────────

/// Encode string headers as AMQP long strings.
pub fn headers_to_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        table.insert(
            name.as_str().into(),
            AMQPValue::LongString(value.as_bytes().to_vec().into()),
        );
    }
    table
}

/// Decode the scalar entries of an AMQP header table. Arrays, nested tables
/// and other non-scalar values are skipped.
pub fn headers_from_table(table: Option<&FieldTable>) -> Headers {
    let Some(table) = table else {
        return Headers::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                AMQPValue::Boolean(b) => b.to_string(),
                AMQPValue::ShortShortInt(n) => n.to_string(),
                AMQPValue::ShortShortUInt(n) => n.to_string(),
                AMQPValue::ShortInt(n) => n.to_string(),
                AMQPValue::ShortUInt(n) => n.to_string(),
                AMQPValue::LongInt(n) => n.to_string(),
                AMQPValue::LongUInt(n) => n.to_string(),
                AMQPValue::LongLongInt(n) => n.to_string(),
                AMQPValue::Timestamp(n) => n.to_string(),
                _ => return None,
            };
            Some((name.as_str().to_string(), value))
        })
        .collect()
}
