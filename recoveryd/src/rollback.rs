//! Restore of the last known-good deployment on escalation.

use crate::command::{CommandError, run_shell};
use async_trait::async_trait;
use recovery_common::util::{mask_sensitive_command, truncate};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("rollback command exited unsuccessfully: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RollbackOutcome {
    Restored { output: String },
    /// No rollback command configured; nothing was done.
    NotConfigured,
}

#[async_trait]
pub trait Rollback: Send + Sync {
    async fn restore_last_known_good(&self) -> Result<RollbackOutcome, RollbackError>;
}

/// Runs an operator-supplied shell command.
pub struct CommandRollback {
    command: Option<String>,
    timeout: Duration,
}

impl CommandRollback {
    pub fn new(command: Option<String>, timeout: Duration) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
            timeout,
        }
    }
}

#[async_trait]
impl Rollback for CommandRollback {
    async fn restore_last_known_good(&self) -> Result<RollbackOutcome, RollbackError> {
        let Some(command) = &self.command else {
            warn!("No rollback command configured; skipping rollback");
            return Ok(RollbackOutcome::NotConfigured);
        };

        info!(command = %mask_sensitive_command(command), "Running rollback");
        let output = run_shell(command, self.timeout).await?;
        if !output.success() {
            return Err(RollbackError::Failed(output.failure_detail()));
        }
        Ok(RollbackOutcome::Restored {
            output: truncate(output.stdout.trim(), 2000),
        })
    }
}

/// Logs the configured command instead of running it.
pub struct DryRunRollback {
    command: Option<String>,
}

impl DryRunRollback {
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
        }
    }
}

#[async_trait]
impl Rollback for DryRunRollback {
    async fn restore_last_known_good(&self) -> Result<RollbackOutcome, RollbackError> {
        match &self.command {
            Some(command) => {
                info!(command = %mask_sensitive_command(command), "Dry-run: would run rollback")
            }
            None => info!("Dry-run: no rollback command configured"),
        }
        Ok(RollbackOutcome::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn dry_run_never_executes_the_command() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("rolled-back");
        let rollback = DryRunRollback::new(Some(format!("touch {}", marker.display())));
        assert_eq!(
            rollback.restore_last_known_good().await.unwrap(),
            RollbackOutcome::NotConfigured
        );
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn unconfigured_is_a_noop() {
        let rollback = CommandRollback::new(Some("   ".into()), Duration::from_secs(1));
        assert_eq!(
            rollback.restore_last_known_good().await.unwrap(),
            RollbackOutcome::NotConfigured
        );
    }

    #[tokio::test]
    async fn successful_command_is_restored() {
        let rollback = CommandRollback::new(Some("echo restored v41".into()), Duration::from_secs(5));
        match rollback.restore_last_known_good().await.unwrap() {
            RollbackOutcome::Restored { output } => assert_eq!(output, "restored v41"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let rollback = CommandRollback::new(
            Some("echo no snapshot >&2; exit 3".into()),
            Duration::from_secs(5),
        );
        let err = rollback.restore_last_known_good().await.unwrap_err();
        assert!(err.to_string().contains("no snapshot"), "{err}");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let rollback = CommandRollback::new(Some("sleep 5".into()), Duration::from_millis(100));
        assert!(matches!(
            rollback.restore_last_known_good().await,
            Err(RollbackError::Command(CommandError::Timeout { .. }))
        ));
    }
}
