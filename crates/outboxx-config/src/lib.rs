mod error;
mod pipeline;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{
    Config, Engine, FlowConfig, Format, OperationConfig, ProcessorConfig, SinkConfig,
    SourceConfig, StreamConfig, StreamSink, StreamSource,
};
