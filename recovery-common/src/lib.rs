//! Shared building blocks for the vLLM recovery controller.
//!
//! This crate holds everything that is independent of the async runtime:
//! the error taxonomy, the log classifier, configuration loading, logging
//! setup and the persisted state record format.

pub mod classify;
pub mod config;
pub mod errors;
pub mod logging;
pub mod testing;
pub mod types;
pub mod util;

pub use classify::{ClassificationRule, Classifier, RuleSpec, SAMPLE_LOGS};
pub use config::{
    ConfigSource, ConfigValueSource, EnvError, EnvParser, LoadedConfig, RecoveryConfig, Sourced,
};
pub use errors::ConfigError;
pub use logging::{LogConfig, LoggingError, LoggingGuards, init_logging};
pub use types::{Alert, ErrorKind, ParseErrorKindError, Phase, RecoveryStateRecord, Severity};
