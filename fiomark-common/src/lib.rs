//! Shared types, configuration and logging for fiomark.

pub mod config;
pub mod logging;
pub mod types;
pub mod units;

pub use config::{ConfigError, ConfigSource, EnvError, EnvParser, FiomarkConfig, Sourced};
pub use logging::{LogConfig, LoggingGuards, init_logging};
pub use types::{
    BlockSize, FillPolicy, GIB, KIB, MIB, ParseBlockSizeError, ParsePatternError, Pattern,
    parse_byte_size,
};
