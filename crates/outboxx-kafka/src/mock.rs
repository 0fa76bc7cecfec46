use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{ProducerError, ProducerResult};
use crate::producer::MessageProducer;

/// One record captured by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// A mock producer for testing the dispatcher.
#[derive(Clone, Default)]
pub struct MockProducer {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    records: Vec<ProducedRecord>,
    pending: usize,
    fail_enqueue: bool,
    fail_flush: bool,
}

impl MockProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose `send` always fails.
    pub fn failing_enqueue() -> Self {
        let mock = Self::new();
        mock.state.lock().unwrap().fail_enqueue = true;
        mock
    }

    /// A mock whose `flush` always times out.
    pub fn failing_flush() -> Self {
        let mock = Self::new();
        mock.state.lock().unwrap().fail_flush = true;
        mock
    }

    /// Stop failing flushes, simulating a recovered broker.
    pub fn recover_flush(&self) {
        self.state.lock().unwrap().fail_flush = false;
    }

    /// All captured records, in send order.
    pub fn records(&self) -> Vec<ProducedRecord> {
        self.state.lock().unwrap().records.clone()
    }

    /// Number of records enqueued since the last successful flush.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.records.clear();
        state.pending = 0;
    }
}

impl MessageProducer for MockProducer {
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> ProducerResult<()> {
        let mut state = self.state.lock().unwrap();

        if state.fail_enqueue {
            return Err(ProducerError::Enqueue {
                topic: topic.to_string(),
                reason: "queue full (simulated)".to_string(),
            });
        }

        state.records.push(ProducedRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        state.pending += 1;
        Ok(())
    }

    fn flush(&self, timeout: Duration) -> ProducerResult<()> {
        let mut state = self.state.lock().unwrap();

        if state.fail_flush {
            return Err(ProducerError::FlushTimeout(timeout));
        }

        state.pending = 0;
        Ok(())
    }
}
