//! Logging initialization.
//!
//! Console output goes to stderr so that JSON command output on stdout stays
//! machine-readable. An optional daily rolling file is written through a
//! non-blocking appender whose guard must outlive the program.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_FILE_PREFIX: &str = "vllm-recovery.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Logging options.
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Default directive when `RUST_LOG` is not set.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Directory for the daily rolling log file.
    pub dir: Option<PathBuf>,
    /// Include ANSI colours on the console.
    pub ansi: bool,
}

impl LogConfig {
    /// Start from `default_level`, honouring `VLLM_RECOVERY_LOG_LEVEL` when set.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("VLLM_RECOVERY_LOG_LEVEL")
            .ok()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        Self {
            level,
            json: false,
            dir: None,
            ansi: true,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_dir(mut self, dir: Option<impl AsRef<Path>>) -> Self {
        self.dir = dir.map(|d| d.as_ref().to_path_buf());
        self
    }

    pub fn without_ansi(mut self) -> Self {
        self.ansi = false;
        self
    }

    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|e| LoggingError::Filter {
            filter: self.level.clone(),
            reason: e.to_string(),
        })
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from_env("info")
    }
}

/// Keeps the file writer alive. Dropping it flushes pending lines.
#[must_use = "dropping the guards stops file logging"]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let filter = config.filter()?;

    let (file_writer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        let console = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr);
        let file = file_writer.map(|w| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(w)
        });
        registry.with(console).with(file).try_init()
    } else {
        let console = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(config.ansi)
            .with_writer(std::io::stderr);
        let file = file_writer.map(|w| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(w)
        });
        registry.with(console).with(file).try_init()
    };
    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(LoggingGuards { _file: guard })
}
