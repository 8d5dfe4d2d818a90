use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Pipeline-wide counters.
///
/// `Relaxed` everywhere: every counter is an independent observation. Share
/// via `Arc<Metrics>`.
#[derive(Debug, Default)]
pub struct Metrics {
    // ── Publish side ──────────────────────────────────────────────────────────
    /// Logical messages handed to the tracker (retries not included).
    pub published: AtomicU64,
    /// Positive confirms.
    pub confirmed: AtomicU64,
    /// Re-publishes after a nack.
    pub retried: AtomicU64,
    /// Messages dropped after exhausting the retry budget.
    pub dropped: AtomicU64,
    /// Messages returned as unroutable.
    pub returned: AtomicU64,
    /// Confirm / return events that failed on the key-value store.
    pub store_failures: AtomicU64,
    /// Publishes that found no free channel within the checkout timeout.
    pub pool_exhausted: AtomicU64,

    // ── Consume side ──────────────────────────────────────────────────────────
    pub acked: AtomicU64,
    pub rejected: AtomicU64,
    /// Messages drained from the dead-letter queue.
    pub dead_lettered: AtomicU64,
    /// Deliveries currently being processed (gauge).
    pub in_flight: AtomicI64,
}

macro_rules! incrementers {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    incrementers! {
        inc_published => published,
        inc_confirmed => confirmed,
        inc_retried => retried,
        inc_dropped => dropped,
        inc_returned => returned,
        inc_store_failures => store_failures,
        inc_pool_exhausted => pool_exhausted,
        inc_acked => acked,
        inc_rejected => rejected,
        inc_dead_lettered => dead_lettered,
    }

    pub fn inc_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Approximate point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        tracing::info!(
            published = s.published,
            confirmed = s.confirmed,
            retried = s.retried,
            dropped = s.dropped,
            returned = s.returned,
            store_failures = s.store_failures,
            pool_exhausted = s.pool_exhausted,
            acked = s.acked,
            rejected = s.rejected,
            dead_lettered = s.dead_lettered,
            in_flight = s.in_flight,
            "📊 metrics summary"
        );
    }
}

/// A point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub confirmed: u64,
    pub retried: u64,
    pub dropped: u64,
    pub returned: u64,
    pub store_failures: u64,
    pub pool_exhausted: u64,
    pub acked: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub in_flight: i64,
}
