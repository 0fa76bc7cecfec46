use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::{debug, info};

use crate::error::{ProducerError, ProducerResult};

/// What the dispatcher needs from a broker client: enqueue without blocking,
/// then flush with a bounded timeout before any LSN acknowledgment.
pub trait MessageProducer: Send + Sync {
    /// Enqueue one record. Returns as soon as the client has buffered it;
    /// delivery is only confirmed by a subsequent successful `flush`.
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> ProducerResult<()>;

    /// Block until every enqueued record is acknowledged by the brokers or
    /// the timeout elapses. Success means the queue fully drained.
    fn flush(&self, timeout: Duration) -> ProducerResult<()>;
}

/// Kafka-backed producer.
pub struct KafkaProducer {
    inner: FutureProducer,
}

impl KafkaProducer {
    /// Create a producer against a comma-separated `host:port` broker list.
    pub fn new(bootstrap_servers: &str) -> ProducerResult<Self> {
        let inner: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| ProducerError::Init(e.to_string()))?;

        info!(brokers = bootstrap_servers, "kafka producer created");

        Ok(Self { inner })
    }
}

impl MessageProducer for KafkaProducer {
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> ProducerResult<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        // The delivery future is dropped on purpose; flush() is the single
        // point where delivery is confirmed.
        match self.inner.send_result(record) {
            Ok(_) => {
                debug!(topic, key, bytes = payload.len(), "enqueued record");
                Ok(())
            }
            Err((e, _)) => Err(ProducerError::Enqueue {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn flush(&self, timeout: Duration) -> ProducerResult<()> {
        self.inner
            .flush(timeout)
            .map_err(|e| ProducerError::Flush(e.to_string()))?;

        if self.inner.in_flight_count() > 0 {
            return Err(ProducerError::FlushTimeout(timeout));
        }
        Ok(())
    }
}
