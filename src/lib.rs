//! At-least-once messaging over RabbitMQ.
//!
//! Publishes with confirms and bounded retries tracked in Redis, records
//! unroutable returns, consumes with manual acknowledgement and drains the
//! dead-letter queue.

pub mod app;
pub mod codec;
pub mod config;
pub mod messaging;
pub mod metrics;
pub mod model;
pub mod reliability;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod worker;
