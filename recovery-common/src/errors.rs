//! Error types shared across the workspace.

use crate::config::EnvError;
use crate::types::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// Any of these is fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid classification rule for {kind}: {reason}")]
    InvalidRule { kind: ErrorKind, reason: String },

    #[error("Invalid pattern '{pattern}' for {kind}: {reason}")]
    InvalidPattern {
        kind: ErrorKind,
        pattern: String,
        reason: String,
    },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("{} environment error(s): {}", .0.len(), join_env_errors(.0))]
    Environment(Vec<EnvError>),

    #[error("{} configuration error(s): {}", .0.len(), join_errors(.0))]
    Validation(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_error_lists_every_problem() {
        let err = ConfigError::Environment(vec![
            EnvError::InvalidValue {
                var: "VLLM_RECOVERY_MAX_ATTEMPTS".to_string(),
                expected: "unsigned 32-bit integer",
                value: "many".to_string(),
            },
            EnvError::InvalidDuration {
                var: "VLLM_RECOVERY_PROBE_INTERVAL".to_string(),
                value: "soon".to_string(),
            },
        ]);
        let message = err.to_string();
        assert!(message.starts_with("2 environment error(s)"));
        assert!(message.contains("VLLM_RECOVERY_MAX_ATTEMPTS"));
        assert!(message.contains("soon"));
    }
}
