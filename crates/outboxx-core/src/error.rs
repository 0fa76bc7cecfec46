use thiserror::Error;

/// Errors from the event model itself.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("json serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
