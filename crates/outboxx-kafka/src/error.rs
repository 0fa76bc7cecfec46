use std::time::Duration;

use thiserror::Error;

/// Errors from the producer facade.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("failed to create producer: {0}")]
    Init(String),

    #[error("failed to enqueue message for topic '{topic}': {reason}")]
    Enqueue { topic: String, reason: String },

    #[error("flush did not drain the queue within {0:?}")]
    FlushTimeout(Duration),

    #[error("flush failed: {0}")]
    Flush(String),
}

pub type ProducerResult<T> = Result<T, ProducerError>;
