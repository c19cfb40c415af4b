//! Bounded execution of external commands.
//!
//! Every invocation carries a timeout. Children are killed when the timeout
//! fires so a hung `systemctl` or `nvidia-smi` cannot outlive the call.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", timeout.as_secs_f64())]
    Timeout { program: String, timeout: Duration },
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Short description of a failure for logs and outcomes.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        let detail = if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        };
        let code = self
            .code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        format!(
            "exit {code}: {}",
            recovery_common::util::truncate(detail, 400)
        )
    }
}

/// Run `program args...` and capture its output.
pub async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    run_command_with_input(program, args, None, timeout).await
}

/// Run a command, optionally feeding `input` on stdin.
pub async fn run_command_with_input(
    program: &str,
    args: &[&str],
    input: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    debug!(program, ?args, "Running command");

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let spawn_error = |source| CommandError::Spawn {
        program: program.to_string(),
        source,
    };

    let mut child = command.spawn().map_err(spawn_error)?;

    let run = async move {
        if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(text.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        child.wait_with_output().await
    };

    let output = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| CommandError::Timeout {
            program: program.to_string(),
            timeout,
        })?
        .map_err(spawn_error)?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command line through `sh -c`.
pub async fn run_shell(command_line: &str, timeout: Duration) -> Result<CommandOutput, CommandError> {
    run_command("sh", &["-c", command_line], timeout).await
}
