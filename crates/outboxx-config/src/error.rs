use thiserror::Error;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("password environment variable '{variable}' is not set")]
    MissingPassword { variable: String },

    #[error("no streams configured")]
    NoStreams,

    #[error("duplicate stream name '{0}'")]
    DuplicateStream(String),

    #[error("stream '{0}' subscribes to no operations")]
    EmptyOperations(String),

    #[error("stream '{0}' has an empty destination topic")]
    EmptyDestination(String),

    #[error("sink has no bootstrap brokers")]
    NoBrokers,

    #[error("processor batch_size must be at least 1")]
    InvalidBatchSize,
}

pub type ConfigResult<T> = Result<T, ConfigError>;
