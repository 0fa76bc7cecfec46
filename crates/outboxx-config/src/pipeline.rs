use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};

/// Top-level pipeline configuration as parsed from TOML.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// PostgreSQL replication source.
    pub source: SourceConfig,
    /// Kafka sink.
    pub sink: SinkConfig,
    /// Dispatcher knobs.
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Configured streams.
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

impl Config {
    /// Parse and validate a configuration from a TOML string.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.sink.brokers.is_empty() {
            return Err(ConfigError::NoBrokers);
        }
        if self.processor.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if self.streams.is_empty() {
            return Err(ConfigError::NoStreams);
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            if !seen.insert(stream.name.as_str()) {
                return Err(ConfigError::DuplicateStream(stream.name.clone()));
            }
            if stream.source.operations.is_empty() {
                return Err(ConfigError::EmptyOperations(stream.name.clone()));
            }
            if stream.sink.destination.is_empty() {
                return Err(ConfigError::EmptyDestination(stream.name.clone()));
            }
        }
        Ok(())
    }

    /// Build the routing table for the dispatcher.
    pub fn routes(&self) -> Vec<outboxx_core::StreamRoute> {
        self.streams.iter().map(StreamConfig::to_route).collect()
    }
}

/// PostgreSQL replication source settings.
#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    /// Name of the environment variable holding the password. The password
    /// itself never appears in the config file.
    pub password_env: String,
    /// Replication slot name (must already exist).
    pub slot: String,
    /// Publication name (must already exist).
    pub publication: String,
    #[serde(default)]
    pub engine: Engine,
}

impl SourceConfig {
    /// Resolve the password from the configured environment variable.
    pub fn password(&self) -> ConfigResult<String> {
        std::env::var(&self.password_env).map_err(|_| ConfigError::MissingPassword {
            variable: self.password_env.clone(),
        })
    }

    /// libpq key=value connection string. Replication-mode options are
    /// appended by the protocol layer.
    pub fn connection_string(&self) -> ConfigResult<String> {
        Ok(format!(
            "host={} port={} user={} password={} dbname={}",
            self.host,
            self.port,
            self.user,
            self.password()?,
            self.database
        ))
    }
}

/// Ingestion engine selector. Only the streaming replication engine exists.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Streaming,
}

/// Kafka sink settings.
#[derive(Debug, Deserialize)]
pub struct SinkConfig {
    /// Bootstrap brokers as `host:port`.
    pub brokers: Vec<String>,
}

impl SinkConfig {
    /// Comma-separated `bootstrap.servers` value.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

/// Dispatcher batching and flush knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Target number of events per receive cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Receive deadline in milliseconds.
    #[serde(default = "default_batch_deadline")]
    pub batch_deadline_ms: u64,
    /// Broker flush timeout in milliseconds.
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,
}

impl ProcessorConfig {
    pub fn batch_deadline(&self) -> Duration {
        Duration::from_millis(self.batch_deadline_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_deadline_ms: default_batch_deadline(),
            flush_timeout_ms: default_flush_timeout(),
        }
    }
}

fn default_port() -> u16 {
    5432
}

fn default_batch_size() -> usize {
    500
}

fn default_batch_deadline() -> u64 {
    1000
}

fn default_flush_timeout() -> u64 {
    5000
}

/// One configured stream: which changes to pick up and where to send them.
#[derive(Debug, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub source: StreamSource,
    #[serde(default)]
    pub flow: FlowConfig,
    pub sink: StreamSink,
}

impl StreamConfig {
    pub fn to_route(&self) -> outboxx_core::StreamRoute {
        outboxx_core::StreamRoute {
            name: self.name.clone(),
            resource: self.source.resource.clone(),
            operations: self
                .source
                .operations
                .iter()
                .map(|op| op.to_core())
                .collect(),
            destination: self.sink.destination.clone(),
            routing_key: self.sink.routing_key.clone(),
        }
    }
}

/// Which relation and operations a stream subscribes to.
#[derive(Debug, Deserialize)]
pub struct StreamSource {
    /// Relation (table) name.
    pub resource: String,
    pub operations: Vec<OperationConfig>,
}

/// Operation names as they appear in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationConfig {
    Insert,
    Update,
    Delete,
}

impl OperationConfig {
    pub fn to_core(self) -> outboxx_core::Operation {
        match self {
            OperationConfig::Insert => outboxx_core::Operation::Insert,
            OperationConfig::Update => outboxx_core::Operation::Update,
            OperationConfig::Delete => outboxx_core::Operation::Delete,
        }
    }
}

/// Event encoding on the wire.
#[derive(Debug, Default, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub format: Format,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
}

/// Where a stream's events are published.
#[derive(Debug, Deserialize)]
pub struct StreamSink {
    /// Destination topic.
    pub destination: String,
    /// Column whose value becomes the partition key.
    pub routing_key: Option<String>,
}
