use thiserror::Error;

use crate::replication::pgoutput::DecodeError;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("START_REPLICATION failed: {0}")]
    StartReplicationFailed(String),

    #[error("invalid replication message: {0}")]
    InvalidMessage(String),

    #[error("failed to send standby status update: {0}")]
    SendFeedbackFailed(String),

    #[error("replication stream closed by server")]
    StreamClosed,

    #[error("replication slot '{0}' does not exist")]
    SlotNotFound(String),

    #[error("publication '{0}' does not exist")]
    PublicationNotFound(String),

    #[error("row change references unknown relation id {0}")]
    UnknownRelation(u32),

    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("postgres error: {0}")]
    Postgres(String),
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Extract database error details if available
        if let Some(db_err) = e.as_db_error() {
            PgError::Postgres(format!(
                "{}: {} (code: {})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code()
            ))
        } else {
            PgError::Postgres(e.to_string())
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;
