mod types;

pub use types::{
    CacheTtls, DiscoveryConfig, ParsingMode, ProcessorConfig, SinkConfig,
};
