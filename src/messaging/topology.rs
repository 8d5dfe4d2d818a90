use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};

// ── Error ──────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("topology declaration failed: {0}")]
pub struct TopologyError(String);

// ── Topology ───────────────────────────────────────────────────────────────────

/// One direct exchange bound to one queue through one routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Route {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// The broker layout the pipeline relies on.
///
/// Both work queues dead-letter into `dead_letter.exchange` with
/// `dead_letter.routing_key`: a reject without requeue (or a message TTL
/// expiry) moves the message to `dead_letter.queue` instead of discarding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub order: Route,
    pub secondary: Route,
    pub dead_letter: Route,
}

impl Topology {
    /// Queues consumed by the dispatcher, as one logical group.
    pub fn work_queues(&self) -> [&str; 2] {
        [&self.order.queue, &self.secondary.queue]
    }

    fn dead_letter_args(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.dead_letter.exchange.as_bytes().to_vec().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(self.dead_letter.routing_key.as_bytes().to_vec().into()),
        );
        args
    }
}

/// Declare exchanges, queues and bindings. Idempotent as long as the
/// existing broker objects were declared with the same arguments.
///
/// - work exchanges: direct, durable, auto-delete
/// - work queues: durable, dead-lettering to the dead-letter exchange
/// - dead-letter exchange: direct, durable; dead-letter queue: durable
pub async fn declare_topology(channel: &Channel, topology: &Topology) -> Result<(), TopologyError> {
    for route in [&topology.order, &topology.secondary] {
        let work_exchange = ExchangeDeclareOptions {
            durable: true,
            auto_delete: true,
            ..Default::default()
        };
        declare_route(channel, route, work_exchange, topology.dead_letter_args()).await?;
    }

    let dead_exchange = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };
    declare_route(channel, &topology.dead_letter, dead_exchange, FieldTable::default()).await?;

    tracing::info!(
        order = %topology.order.queue,
        secondary = %topology.secondary.queue,
        dead_letter = %topology.dead_letter.queue,
        "topology declared"
    );
    Ok(())
}

async fn declare_route(
    channel: &Channel,
    route: &Route,
    exchange_options: ExchangeDeclareOptions,
    queue_args: FieldTable,
) -> Result<(), TopologyError> {
    channel
        .exchange_declare(
            &route.exchange,
            ExchangeKind::Direct,
            exchange_options,
            FieldTable::default(),
        )
        .await
        .map_err(|e| TopologyError(format!("exchange '{}': {e}", route.exchange)))?;

    channel
        .queue_declare(
            &route.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            queue_args,
        )
        .await
        .map_err(|e| TopologyError(format!("queue '{}': {e}", route.queue)))?;

    channel
        .queue_bind(
            &route.queue,
            &route.exchange,
            &route.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            TopologyError(format!(
                "bind '{}' → '{}' via '{}': {e}",
                route.queue, route.exchange, route.routing_key
            ))
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_queues_dead_letter_to_the_dead_route() {
        let topology = Topology {
            order: Route::new("order_exchange", "order_queue", "order"),
            secondary: Route::new("order1_exchange", "order1_queue", "order1"),
            dead_letter: Route::new("dead_exchange", "dead_queue", "dead"),
        };

        let args = topology.dead_letter_args();
        let key = lapin::types::ShortString::from("x-dead-letter-exchange");
        assert_eq!(
            args.inner().get(&key),
            Some(&AMQPValue::LongString(b"dead_exchange".to_vec().into()))
        );
        assert_eq!(topology.work_queues(), ["order_queue", "order1_queue"]);
    }
}
