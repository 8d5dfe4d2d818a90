use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::messaging::{Acknowledger, Delivery};
use crate::metrics::Metrics;
use crate::model::InboundEnvelope;

use super::pool::DeliveryHandler;
use super::processor::{MessageProcessor, ProcessingError};

/// Settles work-queue deliveries.
///
/// ```text
/// delivery ──► processor ──► Ok    ──► ack(multiple = false)
///                      └──► Err   ──► reject(requeue = false) ──► dead-letter queue
///                      └──► panic ──► reject(requeue = false) ──► dead-letter queue
/// ```
///
/// There is no in-process retry: a rejected delivery is terminal here and
/// continues its life on the dead-letter path. Ack and reject failures are
/// logged only; an unsettled delivery is redelivered by the broker once its
/// channel closes.
pub struct Dispatcher {
    processor: Arc<dyn MessageProcessor>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(processor: Arc<dyn MessageProcessor>, metrics: Arc<Metrics>) -> Self {
        Self { processor, metrics }
    }

    async fn run_processor(&self, envelope: &InboundEnvelope) -> Result<(), ProcessingError> {
        match AssertUnwindSafe(self.processor.process(envelope))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(ProcessingError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

#[async_trait]
impl DeliveryHandler for Dispatcher {
    async fn handle(&self, worker: usize, delivery: Delivery) {
        let Delivery { envelope, acker } = delivery;
        let tag = envelope.delivery_tag;
        let correlation_id = envelope.correlation_id();

        self.metrics.inc_in_flight();

        tracing::debug!(
            worker,
            delivery_tag = tag,
            correlation_id = correlation_id.as_ref().map(|c| c.as_str()),
            routing_key = %envelope.routing_key,
            redelivered = envelope.redelivered,
            "▶️  processing delivery"
        );

        let result = self.run_processor(&envelope).await;

        let Some(acker) = acker else {
            tracing::warn!(worker, delivery_tag = tag, "delivery has no acker, nothing to settle");
            self.metrics.dec_in_flight();
            return;
        };

        match result {
            Ok(()) => settle_ack(worker, tag, acker.as_ref(), &self.metrics).await,
            Err(e) => {
                tracing::warn!(
                    worker,
                    delivery_tag = tag,
                    correlation_id = correlation_id.as_ref().map(|c| c.as_str()),
                    error = %e,
                    "❌ processing failed, rejecting to the dead-letter path"
                );
                settle_reject(worker, tag, acker.as_ref(), &self.metrics).await;
            }
        }

        self.metrics.dec_in_flight();
    }
}

async fn settle_ack(worker: usize, tag: u64, acker: &dyn Acknowledger, metrics: &Metrics) {
    match acker.ack(false).await {
        Ok(()) => {
            metrics.inc_acked();
            tracing::debug!(worker, delivery_tag = tag, "✅ acked");
        }
        Err(e) => tracing::error!(worker, delivery_tag = tag, error = %e, "ack failed"),
    }
}

async fn settle_reject(worker: usize, tag: u64, acker: &dyn Acknowledger, metrics: &Metrics) {
    match acker.reject(false).await {
        Ok(()) => metrics.inc_rejected(),
        Err(e) => tracing::error!(worker, delivery_tag = tag, error = %e, "reject failed"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::AckError;
    use crate::worker::processor::{AlwaysFail, DecodeAndLog};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Settled {
        Ack { multiple: bool },
        Reject { requeue: bool },
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Settled>>>,
        broken: bool,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Settled> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Acknowledger for Recorder {
        async fn ack(&self, multiple: bool) -> Result<(), AckError> {
            self.calls.lock().unwrap().push(Settled::Ack { multiple });
            if self.broken {
                return Err(AckError("channel closed".into()));
            }
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), AckError> {
            self.calls.lock().unwrap().push(Settled::Reject { requeue });
            if self.broken {
                return Err(AckError("channel closed".into()));
            }
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl MessageProcessor for Panics {
        async fn process(&self, _: &InboundEnvelope) -> Result<(), ProcessingError> {
            panic!("boom");
        }
    }

    fn delivery(payload: &[u8], recorder: &Recorder) -> Delivery {
        Delivery {
            envelope: InboundEnvelope {
                delivery_tag: 1,
                consumer_tag: "c".into(),
                exchange: "order_exchange".into(),
                routing_key: "order.created".into(),
                redelivered: false,
                payload: payload.to_vec(),
                headers: Default::default(),
            },
            acker: Some(Box::new(recorder.clone())),
        }
    }

    const USER: &[u8] = br#"{"id":1,"username":"ada","email":"ada@example.com"}"#;

    #[tokio::test]
    async fn success_acks_one_delivery() {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(Arc::new(DecodeAndLog::default()), metrics.clone());
        let recorder = Recorder::default();

        dispatcher.handle(0, delivery(USER, &recorder)).await;

        assert_eq!(recorder.calls(), vec![Settled::Ack { multiple: false }]);
        assert_eq!(metrics.snapshot().acked, 1);
        assert_eq!(metrics.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn failure_rejects_without_requeue() {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(Arc::new(AlwaysFail), metrics.clone());
        let recorder = Recorder::default();

        dispatcher.handle(0, delivery(USER, &recorder)).await;

        assert_eq!(recorder.calls(), vec![Settled::Reject { requeue: false }]);
        assert_eq!(metrics.snapshot().rejected, 1);
        assert_eq!(metrics.snapshot().acked, 0);
    }

    #[tokio::test]
    async fn undecodable_payload_is_rejected() {
        let dispatcher = Dispatcher::new(Arc::new(DecodeAndLog::default()), Arc::new(Metrics::new()));
        let recorder = Recorder::default();

        dispatcher.handle(0, delivery(b"\xff\xfe", &recorder)).await;

        assert_eq!(recorder.calls(), vec![Settled::Reject { requeue: false }]);
    }

    #[tokio::test]
    async fn panic_is_caught_and_rejected() {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(Arc::new(Panics), metrics.clone());
        let recorder = Recorder::default();

        dispatcher.handle(0, delivery(USER, &recorder)).await;

        assert_eq!(recorder.calls(), vec![Settled::Reject { requeue: false }]);
        assert_eq!(metrics.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn settle_errors_are_swallowed() {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(Arc::new(DecodeAndLog::default()), metrics.clone());
        let recorder = Recorder {
            broken: true,
            ..Default::default()
        };

        dispatcher.handle(0, delivery(USER, &recorder)).await;

        assert_eq!(recorder.calls().len(), 1);
        assert_eq!(metrics.snapshot().acked, 0);
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "non-string panic payload");
    }
}
