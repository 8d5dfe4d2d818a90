//! Publish-side reliability: confirm tracking with bounded retries and
//! bookkeeping for unroutable returns.

mod counter;
mod returns;
mod tracker;

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::messaging::{BrokerEvent, EventReceiver};
use crate::metrics::Metrics;
use crate::shutdown::ShutdownSignal;

pub use counter::{RetryCounters, COUNTER_TTL, MAX_CAS_ATTEMPTS};
pub use returns::{ReturnHandler, RETURN_RECORD_TTL};
pub use tracker::{ConfirmOutcome, CorrelationTracker, PermanentPublishFailure, TrackerError};

/// Key namespace of retry counters.
pub const RETRY_NAMESPACE: &str = "publish:retry";
/// Key namespace of return records.
pub const RETURN_NAMESPACE: &str = "publish:return";

/// Consume broker events until the channel closes or shutdown is signalled.
///
/// Every event is handled on its own task so a slow store call for one
/// message never holds up the confirms of others. Events for one
/// correlation id are causally ordered by the broker (a retry is only
/// published after the previous confirm was handled), so this does not
/// reorder anything that matters. Handlers still running at shutdown are
/// awaited before returning.
pub async fn run_events(
    mut events: EventReceiver,
    tracker: Arc<CorrelationTracker>,
    returns: Arc<ReturnHandler>,
    metrics: Arc<Metrics>,
    mut shutdown: ShutdownSignal,
) {
    let mut handlers = JoinSet::new();

    loop {
        let event = tokio::select! {
            biased;

            _ = shutdown.wait() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        while let Some(done) = handlers.try_join_next() {
            log_join(done);
        }

        let tracker = Arc::clone(&tracker);
        let returns = Arc::clone(&returns);
        let metrics = Arc::clone(&metrics);
        handlers.spawn(async move { handle_event(event, &tracker, &returns, &metrics).await });
    }

    if !handlers.is_empty() {
        tracing::info!(pending = handlers.len(), "🛑 waiting for broker event handlers");
    }
    while let Some(done) = handlers.join_next().await {
        log_join(done);
    }
    tracing::info!("broker event loop stopped");
}

/// Handle one broker event. Store failures are logged as infrastructure
/// alerts and leave the message's state untouched.
pub async fn handle_event(
    event: BrokerEvent,
    tracker: &CorrelationTracker,
    returns: &ReturnHandler,
    metrics: &Metrics,
) {
    match event {
        BrokerEvent::Confirm(confirm) => {
            let id = confirm.envelope.correlation_id.clone();
            if let Err(e) = tracker.on_confirm(confirm).await {
                if e.is_infrastructure() {
                    metrics.inc_store_failures();
                }
                tracing::error!(
                    correlation_id = %id,
                    error = %e,
                    infrastructure = e.is_infrastructure(),
                    "🚨 confirm could not be processed, message left in flight"
                );
            }
        }
        BrokerEvent::Return(ret) => {
            let exchange = ret.exchange.clone();
            let routing_key = ret.routing_key.clone();
            if let Err(e) = returns.on_return(ret).await {
                if e.is_infrastructure() {
                    metrics.inc_store_failures();
                }
                tracing::error!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    error = %e,
                    infrastructure = e.is_infrastructure(),
                    "🚨 return record could not be stored"
                );
            }
        }
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "broker event handler panicked");
    }
}
