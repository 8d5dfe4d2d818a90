use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{Config, ConfigError, ProcessingMode};
use crate::messaging::{
    declare_topology, event_channel, AckMode, ChannelPool, ConsumerError, Delivery, PoolError,
    RabbitConsumer, RabbitPublisher, Route, TopologyError,
};
use crate::metrics::Metrics;
use crate::model::User;
use crate::reliability::{
    self, CorrelationTracker, RetryCounters, ReturnHandler, RETRY_NAMESPACE, RETURN_NAMESPACE,
};
use crate::retry::RetryPolicy;
use crate::shutdown;
use crate::store::{KvStore, RedisStore, StoreError};
use crate::worker::{
    AlwaysFail, DeadLetterDrain, DecodeAndLog, Dispatcher, MessageProcessor, PoolSize, WorkerPool,
};

// ── Error type ─────────────────────────────────────────────────────────────────

/// Startup and shutdown failures. Once running, nothing below this level
/// stops the process.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("redis error: {0}")]
    Store(#[from] StoreError),
    #[error("rabbitmq pool error: {0}")]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("consumer error: {0}")]
    Consumer(#[from] ConsumerError),
    #[error("signal handler error: {0}")]
    Signal(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// ── Entry point ────────────────────────────────────────────────────────────────

/// Full application lifecycle.
///
/// 1. Load and validate configuration.
/// 2. Connect to Redis and RabbitMQ, declare the topology.
/// 3. Start the broker event loop (confirms and returns).
/// 4. Start the dispatcher pool on both work queues and the drain pool on
///    the dead-letter queue.
/// 5. Optionally publish sample users.
/// 6. Run until SIGINT / SIGTERM, then drain and exit.
pub async fn run() -> Result<(), AppError> {
    // ── 1. Configuration ──────────────────────────────────────────────────────
    let cfg = Config::load()?;
    cfg.log_summary();

    let metrics = Arc::new(Metrics::new());
    let (shutdown_handle, shutdown_signal) = shutdown::new_pair();

    // ── 2. Connections and topology ───────────────────────────────────────────
    let store: Arc<dyn KvStore> = Arc::new(RedisStore::connect(&cfg.redis_url, cfg.store_op_timeout).await?);

    let channels = ChannelPool::connect(
        &cfg.rabbitmq_url,
        cfg.channel_cache_size,
        cfg.channel_checkout_timeout,
    )
    .await?;

    let topology = cfg.topology();
    declare_topology(&channels.open_dedicated().await?, &topology).await?;

    // ── 3. Publish side ───────────────────────────────────────────────────────
    let (events_tx, events_rx) = event_channel();
    let publisher = Arc::new(RabbitPublisher::new(channels.clone(), events_tx));

    let counters = RetryCounters::new(Arc::clone(&store), RETRY_NAMESPACE)
        .with_ttl(cfg.retry_counter_ttl)
        .with_max_cas_attempts(cfg.cas_max_attempts);
    let tracker = Arc::new(CorrelationTracker::new(
        publisher,
        counters,
        RetryPolicy::new(cfg.max_retries),
        Arc::clone(&metrics),
    ));
    let returns = Arc::new(
        ReturnHandler::new(Arc::clone(&store), RETURN_NAMESPACE, Arc::clone(&metrics))
            .with_ttl(cfg.return_record_ttl),
    );

    let events_task = tokio::spawn(reliability::run_events(
        events_rx,
        Arc::clone(&tracker),
        returns,
        Arc::clone(&metrics),
        shutdown_signal.clone(),
    ));

    // ── 4. Consume side ───────────────────────────────────────────────────────
    let processor: Arc<dyn MessageProcessor> = match cfg.processing_mode {
        ProcessingMode::Log => Arc::new(DecodeAndLog::default()),
        ProcessingMode::Fail => Arc::new(AlwaysFail),
    };
    let dispatcher = Arc::new(Dispatcher::new(processor, Arc::clone(&metrics)));

    // Both work queues feed one dispatcher pool.
    let (work_tx, work_rx) = mpsc::channel::<Delivery>(usize::from(cfg.prefetch) * 2);
    for queue in topology.work_queues() {
        RabbitConsumer::new(&channels, queue, cfg.prefetch, AckMode::Manual)
            .await?
            .start(work_tx.clone())
            .await?;
    }
    drop(work_tx);

    let (dead_tx, dead_rx) = mpsc::channel::<Delivery>(usize::from(cfg.prefetch));
    RabbitConsumer::new(&channels, &topology.dead_letter.queue, cfg.prefetch, AckMode::Auto)
        .await?
        .start(dead_tx)
        .await?;

    let work_pool = WorkerPool::new(
        "dispatcher",
        dispatcher,
        PoolSize::new(cfg.consumer_min_workers, cfg.consumer_max_workers),
        cfg.worker_idle_timeout,
    );
    let dead_pool = WorkerPool::new(
        "dead-letter",
        Arc::new(DeadLetterDrain::new(Arc::clone(&metrics))),
        PoolSize::new(cfg.dead_min_workers, cfg.dead_max_workers),
        cfg.worker_idle_timeout,
    );

    let work_task = tokio::spawn(work_pool.run(work_rx, shutdown_signal.clone()));
    let dead_task = tokio::spawn(dead_pool.run(dead_rx, shutdown_signal));

    tracing::info!(
        mode = %cfg.processing_mode,
        "✅ ackline ready, consuming {} and {}",
        topology.order.queue,
        topology.secondary.queue
    );

    // ── 5. Seeding ────────────────────────────────────────────────────────────
    if cfg.seed_messages > 0 {
        seed_users(&tracker, &topology.order, cfg.seed_messages).await;
    }

    // ── 6. Run until signalled ────────────────────────────────────────────────
    shutdown::wait_for_os_signal().await?;
    tracing::info!("🛑 signal received, initiating graceful shutdown...");
    shutdown_handle.trigger();

    work_task.await?;
    dead_task.await?;
    events_task.await?;

    metrics.log_summary();
    tracing::info!("✅ shutdown complete");
    Ok(())
}

/// Publish `count` sample users to `route`. Returns how many publishes the
/// broker took; failures are logged and skipped.
pub async fn seed_users(tracker: &CorrelationTracker, route: &Route, count: usize) -> usize {
    let mut published = 0;

    for n in 1..=count {
        let id = n as i64;
        let user = User::new(id, format!("user{id}"), format!("user{id}@example.com"));

        match tracker.publish_json(&route.exchange, &route.routing_key, &user).await {
            Ok(correlation_id) => {
                published += 1;
                tracing::debug!(correlation_id = %correlation_id, user_id = id, "🌱 seeded");
            }
            Err(e) => tracing::error!(user_id = id, error = %e, "seed publish failed"),
        }
    }

    tracing::info!(published, requested = count, "🌱 sample users published");
    published
}
