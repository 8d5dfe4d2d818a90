use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::messaging::Delivery;
use crate::shutdown::ShutdownSignal;

/// Something that settles one delivery. Implementations must not panic out
/// of `handle`; the pool logs a panicked worker but does not replace it.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, worker: usize, delivery: Delivery);
}

/// Worker bounds of an elastic pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    /// Workers that live for the whole run.
    pub min: usize,
    /// Upper bound including extra workers.
    pub max: usize,
}

impl PoolSize {
    pub fn new(min: usize, max: usize) -> Self {
        let min = min.max(1);
        Self { min, max: max.max(min) }
    }
}

type SharedRx = Arc<Mutex<mpsc::Receiver<Delivery>>>;

#[derive(Debug, Default)]
struct PoolState {
    live: AtomicUsize,
    idle: AtomicUsize,
}

/// Read-only view of a running pool's worker counts.
#[derive(Debug, Clone)]
pub struct WorkerGauge(Arc<PoolState>);

impl WorkerGauge {
    pub fn live(&self) -> usize {
        self.0.live.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.0.idle.load(Ordering::SeqCst)
    }
}

/// Elastic worker pool.
///
/// ```text
/// deliveries (mpsc from one or more consumers)
///     │
///     │  dispatch loop: backpressure point, grows the pool
///     ▼
/// internal channel (bounded, capacity = max × 2)
///     │
///     │  Arc<Mutex<Receiver>> shared by every worker
///     ▼
/// worker-0 .. worker-(min-1)   core, live until shutdown
/// worker-min .. worker-(max-1) extra, retire after `idle_timeout`
/// ```
///
/// The dispatch loop spawns an extra worker whenever a delivery arrives and
/// no worker is waiting for one, as long as fewer than `max` are live. When
/// the internal channel is full, `send().await` blocks the dispatch loop,
/// which stops it reading from the consumers; their prefetch limit then
/// holds the remaining messages at the broker.
///
/// On shutdown (or when every consumer has hung up) the internal sender is
/// dropped, workers finish what is queued and exit, and `run` returns once
/// all of them are joined.
pub struct WorkerPool<H> {
    name: &'static str,
    handler: Arc<H>,
    size: PoolSize,
    idle_timeout: Duration,
    state: Arc<PoolState>,
}

impl<H: DeliveryHandler> WorkerPool<H> {
    pub fn new(name: &'static str, handler: Arc<H>, size: PoolSize, idle_timeout: Duration) -> Self {
        Self {
            name,
            handler,
            size,
            idle_timeout,
            state: Arc::new(PoolState::default()),
        }
    }

    pub fn gauge(&self) -> WorkerGauge {
        WorkerGauge(Arc::clone(&self.state))
    }

    pub async fn run(self, mut deliveries: mpsc::Receiver<Delivery>, mut shutdown: ShutdownSignal) {
        let (internal_tx, internal_rx) = mpsc::channel::<Delivery>(self.size.max * 2);
        let shared_rx: SharedRx = Arc::new(Mutex::new(internal_rx));

        let mut workers = JoinSet::new();
        let mut next_id = 0;

        for _ in 0..self.size.min {
            self.spawn_worker(&mut workers, &shared_rx, next_id, None);
            next_id += 1;
        }

        tracing::info!(
            pool = self.name,
            min = self.size.min,
            max = self.size.max,
            "👷 {} workers ready",
            self.size.min
        );

        loop {
            let delivery = tokio::select! {
                biased;

                _ = shutdown.wait() => {
                    tracing::info!(pool = self.name, "🛑 shutdown signal received, draining in-flight deliveries...");
                    break;
                }

                delivery = deliveries.recv() => match delivery {
                    Some(d) => d,
                    None => break,
                },
            };

            while let Some(done) = workers.try_join_next() {
                if let Err(e) = done {
                    tracing::error!(pool = self.name, error = %e, "worker task panicked");
                }
            }

            if self.state.idle.load(Ordering::SeqCst) == 0
                && self.state.live.load(Ordering::SeqCst) < self.size.max
            {
                self.spawn_worker(&mut workers, &shared_rx, next_id, Some(self.idle_timeout));
                tracing::debug!(
                    pool = self.name,
                    worker = next_id,
                    live = self.state.live.load(Ordering::SeqCst),
                    "➕ extra worker started"
                );
                next_id += 1;
            }

            if internal_tx.send(delivery).await.is_err() {
                tracing::error!(pool = self.name, "internal delivery channel closed unexpectedly");
                break;
            }
        }

        drop(internal_tx);

        tracing::info!(pool = self.name, "🛑 draining {} workers...", workers.len());

        while let Some(done) = workers.join_next().await {
            if let Err(e) = done {
                tracing::error!(pool = self.name, error = %e, "worker task panicked during shutdown");
            }
        }

        tracing::info!(pool = self.name, "all workers stopped");
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<()>,
        rx: &SharedRx,
        id: usize,
        idle_timeout: Option<Duration>,
    ) {
        // Counted before the task starts so the dispatch loop never overshoots.
        self.state.live.fetch_add(1, Ordering::SeqCst);
        workers.spawn(worker_loop(
            self.name,
            id,
            Arc::clone(rx),
            Arc::clone(&self.handler),
            idle_timeout,
            Arc::clone(&self.state),
        ));
    }
}

async fn worker_loop<H: DeliveryHandler>(
    pool: &'static str,
    id: usize,
    rx: SharedRx,
    handler: Arc<H>,
    idle_timeout: Option<Duration>,
    state: Arc<PoolState>,
) {
    tracing::debug!(pool, worker = id, "worker started");

    loop {
        state.idle.fetch_add(1, Ordering::SeqCst);
        let next = match idle_timeout {
            None => Some(recv(&rx).await),
            Some(limit) => tokio::time::timeout(limit, recv(&rx)).await.ok(),
        };
        state.idle.fetch_sub(1, Ordering::SeqCst);

        match next {
            Some(Some(delivery)) => handler.handle(id, delivery).await,
            Some(None) => {
                tracing::debug!(pool, worker = id, "worker stopping");
                break;
            }
            None => {
                tracing::debug!(pool, worker = id, "➖ idle extra worker retired");
                break;
            }
        }
    }

    state.live.fetch_sub(1, Ordering::SeqCst);
}

/// The lock is held only while waiting, never while handling.
async fn recv(rx: &SharedRx) -> Option<Delivery> {
    rx.lock().await.recv().await
}
