//! Thin producer facade over the Kafka client: non-blocking enqueue plus a
//! bounded synchronous flush, which is all the dispatcher needs to decide
//! whether an LSN may be acknowledged.

mod error;
mod mock;
mod producer;

pub use error::{ProducerError, ProducerResult};
pub use mock::{MockProducer, ProducedRecord};
pub use producer::{KafkaProducer, MessageProducer};
