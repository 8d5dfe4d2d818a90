//! Consume side: elastic worker pools, the work-queue dispatcher and the
//! dead-letter drain.

mod drain;
mod pool;
mod processor;
mod task;

pub use drain::{DeadLetter, DeadLetterDrain, JOURNAL_CAPACITY};
pub use pool::{DeliveryHandler, PoolSize, WorkerGauge, WorkerPool};
pub use processor::{AlwaysFail, DecodeAndLog, MessageProcessor, ProcessingError};
pub use task::Dispatcher;
