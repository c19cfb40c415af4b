//! Core types shared by the controller, the CLI and the status surfaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classified category of a service failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CudaOutOfMemory,
    ModelLoadingFailed,
    ApiTimeout,
    GpuCommunicationError,
    ServiceCrash,
    DiskFull,
    MemoryExhausted,
    ConfigError,
    PermissionError,
    NetworkError,
    Unknown,
}

impl ErrorKind {
    /// Every kind, in classification declaration order with `Unknown` last.
    pub const ALL: [ErrorKind; 11] = [
        Self::CudaOutOfMemory,
        Self::ModelLoadingFailed,
        Self::GpuCommunicationError,
        Self::ApiTimeout,
        Self::ServiceCrash,
        Self::DiskFull,
        Self::MemoryExhausted,
        Self::ConfigError,
        Self::PermissionError,
        Self::NetworkError,
        Self::Unknown,
    ];

    /// Stable snake_case label used in logs, metrics and the state file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CudaOutOfMemory => "cuda_out_of_memory",
            Self::ModelLoadingFailed => "model_loading_failed",
            Self::ApiTimeout => "api_timeout",
            Self::GpuCommunicationError => "gpu_communication_error",
            Self::ServiceCrash => "service_crash",
            Self::DiskFull => "disk_full",
            Self::MemoryExhausted => "memory_exhausted",
            Self::ConfigError => "config_error",
            Self::PermissionError => "permission_error",
            Self::NetworkError => "network_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name an [`ErrorKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown error kind '{0}' (expected one of: {names})", names = ErrorKind::ALL.map(|k| k.as_str()).join(", "))]
pub struct ParseErrorKindError(pub String);

impl FromStr for ErrorKind {
    type Err = ParseErrorKindError;

    /// Accepts `CudaOutOfMemory`, `cuda_out_of_memory` and `cuda-out-of-memory`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().replace('_', "") == folded)
            .ok_or_else(|| ParseErrorKindError(s.to_string()))
    }
}

/// Phase of the recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Last probe succeeded.
    Healthy,
    /// A probe failed; classification done, no strategy dispatched yet.
    Degraded,
    /// A remediation strategy has been dispatched for the current streak.
    Recovering,
    /// Remediation budget exhausted; rollback invoked, cooling down.
    Escalated,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Recovering => "recovering",
            Self::Escalated => "escalated",
        }
    }

    /// Numeric encoding for the phase gauge.
    pub fn ordinal(&self) -> i64 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Recovering => 2,
            Self::Escalated => 3,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound alert delivered to every configured sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, title, message)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, title, message)
    }

    pub fn critical(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, title, message)
    }
}

/// Persisted snapshot of the controller's recovery state.
///
/// Overwritten after every phase transition. External readers only ever
/// see copies of this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStateRecord {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub error_kind: Option<ErrorKind>,
    pub attempt_count: u32,
    pub message: String,
}

impl RecoveryStateRecord {
    /// The record a freshly started controller begins with.
    pub fn initial() -> Self {
        Self {
            timestamp: Utc::now(),
            phase: Phase::Healthy,
            error_kind: None,
            attempt_count: 0,
            message: "controller started".to_string(),
        }
    }
}

impl Default for RecoveryStateRecord {
    fn default() -> Self {
        Self::initial()
    }
}
