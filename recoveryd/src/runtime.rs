//! Service runtime contract and its systemd implementation.

use crate::command::{CommandError, CommandOutput, run_command};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{action} {unit} failed: {detail}")]
    Failed {
        action: &'static str,
        unit: String,
        detail: String,
    },
}

/// Control over the managed unit.
///
/// Every call is bounded; a timeout surfaces as [`RuntimeError::Command`].
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Name of the managed unit, for messages.
    fn unit(&self) -> &str;

    /// Verify the runtime tooling can be invoked at all.
    async fn preflight(&self) -> Result<(), RuntimeError>;

    async fn is_active(&self) -> Result<bool, RuntimeError>;

    async fn start(&self) -> Result<(), RuntimeError>;

    async fn stop(&self) -> Result<(), RuntimeError>;

    async fn restart(&self) -> Result<(), RuntimeError>;

    /// Human-readable unit status.
    async fn status_text(&self) -> Result<String, RuntimeError>;

    /// The last `lines` lines of the unit's journal.
    async fn recent_logs(&self, lines: u32) -> Result<String, RuntimeError>;
}

/// `systemctl` / `journalctl` backed runtime.
#[derive(Debug, Clone)]
pub struct SystemdRuntime {
    unit: String,
    timeout: Duration,
}

impl SystemdRuntime {
    pub fn new(unit: impl Into<String>, timeout: Duration) -> Self {
        Self {
            unit: unit.into(),
            timeout,
        }
    }

    async fn systemctl(&self, action: &'static str) -> Result<CommandOutput, RuntimeError> {
        let output = run_command("systemctl", &[action, &self.unit], self.timeout).await?;
        if !output.success() {
            return Err(RuntimeError::Failed {
                action,
                unit: self.unit.clone(),
                detail: output.failure_detail(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl ServiceRuntime for SystemdRuntime {
    fn unit(&self) -> &str {
        &self.unit
    }

    async fn preflight(&self) -> Result<(), RuntimeError> {
        let output = run_command("systemctl", &["--version"], self.timeout).await?;
        if !output.success() {
            return Err(RuntimeError::Failed {
                action: "probe systemd for",
                unit: self.unit.clone(),
                detail: output.failure_detail(),
            });
        }
        debug!(unit = %self.unit, "systemd runtime available");
        Ok(())
    }

    async fn is_active(&self) -> Result<bool, RuntimeError> {
        let output = run_command(
            "systemctl",
            &["is-active", "--quiet", &self.unit],
            self.timeout,
        )
        .await?;
        Ok(output.success())
    }

    async fn start(&self) -> Result<(), RuntimeError> {
        info!(unit = %self.unit, "Starting service");
        self.systemctl("start").await.map(|_| ())
    }

    async fn stop(&self) -> Result<(), RuntimeError> {
        info!(unit = %self.unit, "Stopping service");
        self.systemctl("stop").await.map(|_| ())
    }

    async fn restart(&self) -> Result<(), RuntimeError> {
        info!(unit = %self.unit, "Restarting service");
        self.systemctl("restart").await.map(|_| ())
    }

    async fn status_text(&self) -> Result<String, RuntimeError> {
        // `systemctl status` exits non-zero for inactive units; the text is still wanted.
        let output = run_command(
            "systemctl",
            &["status", "--no-pager", "--full", &self.unit],
            self.timeout,
        )
        .await?;
        Ok(format!("{}{}", output.stdout, output.stderr))
    }

    async fn recent_logs(&self, lines: u32) -> Result<String, RuntimeError> {
        let lines = lines.to_string();
        let output = run_command(
            "journalctl",
            &["-u", &self.unit, "-n", &lines, "--no-pager", "-o", "cat"],
            self.timeout,
        )
        .await?;
        if !output.success() {
            return Err(RuntimeError::Failed {
                action: "read journal of",
                unit: self.unit.clone(),
                detail: output.failure_detail(),
            });
        }
        Ok(output.stdout)
    }
}
