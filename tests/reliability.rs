//! Publish-side scenarios against the in-memory broker and store.

use std::sync::Arc;
use std::time::Duration;

use ackline::app::seed_users;
use ackline::messaging::{
    event_channel, BrokerEvent, ConfirmEvent, EventReceiver, InMemoryBroker, Reply, ReturnEvent,
};
use ackline::metrics::Metrics;
use ackline::model::CorrelationId;
use ackline::reliability::{
    self, ConfirmOutcome, CorrelationTracker, RetryCounters, ReturnHandler, RETRY_NAMESPACE,
    RETURN_NAMESPACE,
};
use ackline::retry::RetryPolicy;
use ackline::shutdown;
use ackline::store::InMemoryStore;

struct Pipeline {
    broker: Arc<InMemoryBroker>,
    store: Arc<InMemoryStore>,
    metrics: Arc<Metrics>,
    tracker: Arc<CorrelationTracker>,
    returns: Arc<ReturnHandler>,
    events: EventReceiver,
}

fn pipeline(configure: impl FnOnce(InMemoryBroker) -> InMemoryBroker) -> Pipeline {
    let (tx, events) = event_channel();
    let broker = Arc::new(configure(InMemoryBroker::new(tx)));
    let store = Arc::new(InMemoryStore::new());
    let metrics = Arc::new(Metrics::new());
    let tracker = Arc::new(CorrelationTracker::new(
        broker.clone(),
        RetryCounters::new(store.clone(), RETRY_NAMESPACE),
        RetryPolicy::default(),
        metrics.clone(),
    ));
    let returns = Arc::new(ReturnHandler::new(store.clone(), RETURN_NAMESPACE, metrics.clone()));

    Pipeline {
        broker,
        store,
        metrics,
        tracker,
        returns,
        events,
    }
}

impl Pipeline {
    async fn next_event(&mut self) -> BrokerEvent {
        tokio::time::timeout(Duration::from_secs(1), self.events.recv())
            .await
            .expect("broker event")
            .expect("open event channel")
    }

    async fn next_confirm(&mut self) -> ConfirmEvent {
        match self.next_event().await {
            BrokerEvent::Confirm(c) => c,
            other => panic!("expected a confirm, got {other:?}"),
        }
    }

    async fn next_return(&mut self) -> ReturnEvent {
        match self.next_event().await {
            BrokerEvent::Return(r) => r,
            other => panic!("expected a return, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn nack_nack_ack_counts_up_then_cleans_up() {
    let mut p = pipeline(|b| {
        b.with_script([Reply::Nack("busy".into()), Reply::Nack("busy".into())])
            .with_fallback(Reply::Ack)
    });

    let id = p.tracker.publish("order_exchange", "order_routing_key", b"{}".to_vec()).await.unwrap();
    let mut observed = Vec::new();

    for _ in 0..2 {
        let confirm = p.next_confirm().await;
        assert!(!confirm.accepted);
        let outcome = p.tracker.on_confirm(confirm).await.unwrap();
        assert!(matches!(outcome, ConfirmOutcome::Retried { .. }));
        observed.push(p.tracker.counters().current(&id).await.unwrap());
    }

    let confirm = p.next_confirm().await;
    assert!(confirm.accepted);
    assert!(matches!(p.tracker.on_confirm(confirm).await.unwrap(), ConfirmOutcome::Confirmed));

    assert_eq!(observed, vec![Some(1), Some(2)]);
    assert_eq!(p.tracker.counters().current(&id).await.unwrap(), None);
    assert_eq!(p.broker.publish_count(), 3);
    assert!(p.store.is_empty());

    let s = p.metrics.snapshot();
    assert_eq!((s.published, s.retried, s.confirmed), (1, 2, 1));
}

#[tokio::test]
async fn always_unroutable_stores_one_attributed_record() {
    let mut p = pipeline(|b| b.with_fallback(Reply::no_route()));

    let id = p.tracker.publish("order_exchange", "nowhere", b"lost".to_vec()).await.unwrap();

    let ret = p.next_return().await;
    let record = p.returns.on_return(ret).await.unwrap();
    let confirm = p.next_confirm().await;
    assert!(matches!(p.tracker.on_confirm(confirm).await.unwrap(), ConfirmOutcome::Confirmed));

    assert!(record.attributed);
    assert_eq!(record.correlation_id, id);

    let stored = p.returns.lookup(&id).await.unwrap().expect("stored record");
    assert_eq!(stored.exchange, "order_exchange");
    assert_eq!(stored.routing_key, "nowhere");
    assert_eq!(stored.error_detail, "NO_ROUTE");
    assert_eq!(stored.message, b"lost");

    assert_eq!(p.broker.publish_count(), 1, "returns are never retried");
    assert_eq!(p.store.len(), 1);
}

#[tokio::test]
async fn stripped_headers_give_an_unattributed_record() {
    let mut p = pipeline(|b| b.with_fallback(Reply::no_route()).stripping_headers());

    let id = p.tracker.publish("order_exchange", "nowhere", b"lost".to_vec()).await.unwrap();

    let ret = p.next_return().await;
    let record = p.returns.on_return(ret).await.unwrap();

    assert!(!record.attributed);
    assert_ne!(record.correlation_id, id);
    assert!(record.correlation_id.as_str().starts_with("unattributed-"));
    assert!(p.returns.lookup(&record.correlation_id).await.unwrap().is_some());
    assert!(p.returns.lookup(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn event_loop_drops_after_the_retry_budget() {
    let p = pipeline(|b| b.with_fallback(Reply::Nack("malformed".into())));
    let (handle, signal) = shutdown::new_pair();

    let task = tokio::spawn(reliability::run_events(
        p.events,
        p.tracker.clone(),
        p.returns.clone(),
        p.metrics.clone(),
        signal,
    ));

    p.tracker.publish("order_exchange", "order_routing_key", b"x".to_vec()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while p.metrics.snapshot().dropped == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    handle.trigger();
    task.await.unwrap();

    assert_eq!(p.broker.publish_count(), 5, "no sixth publish");
    assert_eq!(p.metrics.snapshot().retried, 4);
}

#[tokio::test(start_paused = true)]
async fn abandoned_counters_expire() {
    let mut p = pipeline(|b| b.with_fallback(Reply::Nack("busy".into())));

    let id = p.tracker.publish("ex", "rk", b"x".to_vec()).await.unwrap();
    let confirm = p.next_confirm().await;
    p.tracker.on_confirm(confirm).await.unwrap();
    assert_eq!(p.tracker.counters().current(&id).await.unwrap(), Some(1));

    // The retry's confirm is never handled: the counter goes away on its own.
    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(p.tracker.counters().current(&id).await.unwrap(), None);
}

#[tokio::test]
async fn seeding_publishes_distinct_users() {
    let p = pipeline(|b| b);
    let route = ackline::messaging::Route::new("order_exchange", "order_queue", "order_routing_key");

    let published = seed_users(&p.tracker, &route, 3).await;

    assert_eq!(published, 3);
    let sent = p.broker.published();
    assert!(sent.iter().all(|e| e.routing_key == "order_routing_key"));
    let ids: std::collections::HashSet<CorrelationId> =
        sent.iter().map(|e| e.correlation_id.clone()).collect();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn seeding_without_free_channels_counts_exhaustion() {
    let p = pipeline(|b| b.with_fallback(Reply::Exhausted));
    let route = ackline::messaging::Route::new("order_exchange", "order_queue", "order_routing_key");

    let published = seed_users(&p.tracker, &route, 2).await;

    assert_eq!(published, 0);
    let s = p.metrics.snapshot();
    assert_eq!((s.published, s.pool_exhausted), (0, 2));
    assert!(p.store.is_empty());
}
