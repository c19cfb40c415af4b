//! Remediation strategies and their executor.
//!
//! Every [`ErrorKind`] maps to exactly one [`RecoveryStrategy`]: a short list
//! of [`RemediationAction`]s followed by the common terminal step (restart
//! the service, then wait until it probes healthy or the restart timeout
//! elapses). Execution never raises: action errors, timeouts and panics all
//! come back as [`StrategyOutcome::Failure`].

use crate::command::{CommandError, run_command};
use crate::events::EventBus;
use crate::health::{Probe, wait_until_healthy};
use crate::runtime::{RuntimeError, ServiceRuntime};
use crate::service_config::{
    self, DEFAULT_GPU_MEMORY_UTILIZATION, DEFAULT_MAX_NUM_SEQS, EnvFileError, RestoreOutcome,
};
use async_trait::async_trait;
use recovery_common::ErrorKind;
use recovery_common::config::{RecoveryConfig, RemediationConfig};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound on the interval between health polls while waiting for a restart.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Actions and strategies
// ---------------------------------------------------------------------------

/// A single external remediation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    StopService,
    KillGpuProcesses,
    LowerGpuMemory,
    ResetGpus,
    ClearCompileCache,
    PurgeOldLogs,
    DropPageCaches,
    LowerMaxNumSeqs,
    RestoreConfigBackup,
    FixPermissions,
}

impl RemediationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopService => "stop_service",
            Self::KillGpuProcesses => "kill_gpu_processes",
            Self::LowerGpuMemory => "lower_gpu_memory",
            Self::ResetGpus => "reset_gpus",
            Self::ClearCompileCache => "clear_compile_cache",
            Self::PurgeOldLogs => "purge_old_logs",
            Self::DropPageCaches => "drop_page_caches",
            Self::LowerMaxNumSeqs => "lower_max_num_seqs",
            Self::RestoreConfigBackup => "restore_config_backup",
            Self::FixPermissions => "fix_permissions",
        }
    }

    /// Best-effort actions log their failure and let the strategy continue.
    pub fn best_effort(&self) -> bool {
        matches!(
            self,
            Self::KillGpuProcesses | Self::ResetGpus | Self::DropPageCaches | Self::FixPermissions
        )
    }
}

/// Named remediation procedure for one error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryStrategy {
    pub name: &'static str,
    /// Steps run before the terminal restart.
    pub actions: &'static [RemediationAction],
}

impl RecoveryStrategy {
    const RESTART_SERVICE: Self = Self {
        name: "restart_service",
        actions: &[],
    };

    /// The strategy for `kind`. Total over every kind.
    pub fn for_kind(kind: ErrorKind) -> Self {
        use RemediationAction::*;
        match kind {
            ErrorKind::CudaOutOfMemory => Self {
                name: "reduce_gpu_memory",
                actions: &[StopService, KillGpuProcesses, LowerGpuMemory],
            },
            ErrorKind::ModelLoadingFailed => Self {
                name: "reload_model",
                actions: &[StopService, ClearCompileCache],
            },
            ErrorKind::GpuCommunicationError => Self {
                name: "reset_gpus",
                actions: &[StopService, KillGpuProcesses, ResetGpus],
            },
            ErrorKind::DiskFull => Self {
                name: "free_disk_space",
                actions: &[PurgeOldLogs, ClearCompileCache],
            },
            ErrorKind::MemoryExhausted => Self {
                name: "free_host_memory",
                actions: &[StopService, DropPageCaches, LowerMaxNumSeqs],
            },
            ErrorKind::ConfigError => Self {
                name: "restore_config",
                actions: &[StopService, RestoreConfigBackup],
            },
            ErrorKind::PermissionError => Self {
                name: "fix_permissions",
                actions: &[FixPermissions],
            },
            ErrorKind::ApiTimeout
            | ErrorKind::ServiceCrash
            | ErrorKind::NetworkError
            | ErrorKind::Unknown => Self::RESTART_SERVICE,
        }
    }
}

// ---------------------------------------------------------------------------
// Action runners
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    EnvFile(#[from] EnvFileError),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Failed(String),
}

/// Performs remediation actions against the host.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Run one action, returning a short description of what changed.
    async fn run(&self, action: RemediationAction) -> Result<String, ActionError>;

    /// The common terminal step's restart.
    async fn restart_service(&self) -> Result<(), ActionError>;
}

/// Paths and knobs the system actions operate on.
#[derive(Debug, Clone)]
pub struct ActionSettings {
    pub env_file: PathBuf,
    pub config_backup_dir: PathBuf,
    pub log_dir: PathBuf,
    pub compile_cache_dir: PathBuf,
    pub service_user: String,
    pub remediation: RemediationConfig,
    pub nvidia_smi: String,
    pub drop_caches_path: PathBuf,
}

impl ActionSettings {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            env_file: config.service.env_file.clone(),
            config_backup_dir: config.service.config_backup_dir.clone(),
            log_dir: config.service.log_dir.clone(),
            compile_cache_dir: config.service.compile_cache_dir.clone(),
            service_user: config.service.user.clone(),
            remediation: config.remediation.clone(),
            nvidia_smi: "nvidia-smi".to_string(),
            drop_caches_path: PathBuf::from("/proc/sys/vm/drop_caches"),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.remediation.action_timeout_secs)
    }
}

/// Executes actions for real.
pub struct SystemActions {
    runtime: Arc<dyn ServiceRuntime>,
    settings: ActionSettings,
}

impl SystemActions {
    pub fn new(runtime: Arc<dyn ServiceRuntime>, settings: ActionSettings) -> Self {
        Self { runtime, settings }
    }

    async fn kill_gpu_processes(&self) -> Result<String, ActionError> {
        let output = run_command(
            &self.settings.nvidia_smi,
            &["--query-compute-apps=pid", "--format=csv,noheader"],
            self.settings.timeout(),
        )
        .await?;
        if !output.success() {
            return Err(ActionError::Failed(format!(
                "nvidia-smi: {}",
                output.failure_detail()
            )));
        }

        let pids = parse_pids(&output.stdout);
        let mut killed = 0;
        for pid in &pids {
            let pid = pid.to_string();
            match run_command("kill", &["-9", &pid], self.settings.timeout()).await {
                Ok(out) if out.success() => killed += 1,
                Ok(out) => debug!(pid, detail = %out.failure_detail(), "kill failed"),
                Err(e) => debug!(pid, error = %e, "kill failed"),
            }
        }
        Ok(format!("killed {killed} of {} GPU processes", pids.len()))
    }

    async fn reset_gpus(&self) -> Result<String, ActionError> {
        let output = run_command(
            &self.settings.nvidia_smi,
            &["--gpu-reset"],
            self.settings.timeout(),
        )
        .await?;
        if output.success() {
            Ok("GPUs reset".to_string())
        } else {
            Err(ActionError::Failed(format!(
                "nvidia-smi --gpu-reset: {}",
                output.failure_detail()
            )))
        }
    }

    async fn clear_compile_cache(&self) -> Result<String, ActionError> {
        let dir = &self.settings.compile_cache_dir;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(format!("removed {}", dir.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok("compile cache already absent".to_string())
            }
            Err(source) => Err(ActionError::Io {
                path: dir.clone(),
                source,
            }),
        }
    }

    fn purge_old_logs(&self) -> Result<String, ActionError> {
        let max_age = Duration::from_secs(u64::from(self.settings.remediation.log_retention_days) * 86_400);
        let removed = purge_older_than(&self.settings.log_dir, max_age).map_err(|source| {
            ActionError::Io {
                path: self.settings.log_dir.clone(),
                source,
            }
        })?;
        Ok(format!(
            "removed {removed} log files older than {} days",
            self.settings.remediation.log_retention_days
        ))
    }

    async fn drop_page_caches(&self) -> Result<String, ActionError> {
        run_command("sync", &[], self.settings.timeout()).await?;
        let path = &self.settings.drop_caches_path;
        tokio::fs::write(path, "3\n")
            .await
            .map_err(|source| ActionError::Io {
                path: path.clone(),
                source,
            })?;
        Ok("page caches dropped".to_string())
    }

    fn lower_gpu_memory(&self) -> Result<String, ActionError> {
        let r = &self.settings.remediation;
        let adj = service_config::lower_fraction(
            &self.settings.env_file,
            &r.gpu_memory_var,
            r.gpu_memory_step,
            r.gpu_memory_floor,
            DEFAULT_GPU_MEMORY_UTILIZATION,
        )?;
        Ok(if adj.at_floor {
            format!("{} already at floor {:.2}", adj.key, adj.to)
        } else {
            format!("{} {:.2} -> {:.2}", adj.key, adj.from, adj.to)
        })
    }

    fn lower_max_num_seqs(&self) -> Result<String, ActionError> {
        let r = &self.settings.remediation;
        let adj = service_config::lower_count(
            &self.settings.env_file,
            &r.max_num_seqs_var,
            r.max_num_seqs_step,
            r.max_num_seqs_floor,
            DEFAULT_MAX_NUM_SEQS,
        )?;
        Ok(if adj.at_floor {
            format!("{} already at floor {}", adj.key, adj.to)
        } else {
            format!("{} {} -> {}", adj.key, adj.from, adj.to)
        })
    }

    fn restore_config_backup(&self) -> Result<String, ActionError> {
        let outcome = service_config::restore_latest_backup(
            &self.settings.config_backup_dir,
            &self.settings.env_file,
        )?;
        Ok(match outcome {
            RestoreOutcome::Restored { from } => format!("restored {}", from.display()),
            RestoreOutcome::AlreadyCurrent { from } => {
                format!("config already matches {}", from.display())
            }
        })
    }

    async fn fix_permissions(&self) -> Result<String, ActionError> {
        let owner = format!("{0}:{0}", self.settings.service_user);
        let dirs: Vec<String> = [&self.settings.log_dir, &self.settings.compile_cache_dir]
            .into_iter()
            .filter(|d| d.exists())
            .map(|d| d.to_string_lossy().into_owned())
            .collect();
        if dirs.is_empty() {
            return Ok("no directories to fix".to_string());
        }

        let mut args = vec!["-R", owner.as_str()];
        args.extend(dirs.iter().map(String::as_str));
        let output = run_command("chown", &args, self.settings.timeout()).await?;
        if output.success() {
            Ok(format!("ownership of {} set to {owner}", dirs.join(", ")))
        } else {
            Err(ActionError::Failed(format!("chown: {}", output.failure_detail())))
        }
    }
}

#[async_trait]
impl ActionRunner for SystemActions {
    async fn run(&self, action: RemediationAction) -> Result<String, ActionError> {
        match action {
            RemediationAction::StopService => {
                self.runtime.stop().await?;
                Ok(format!("stopped {}", self.runtime.unit()))
            }
            RemediationAction::KillGpuProcesses => self.kill_gpu_processes().await,
            RemediationAction::LowerGpuMemory => self.lower_gpu_memory(),
            RemediationAction::ResetGpus => self.reset_gpus().await,
            RemediationAction::ClearCompileCache => self.clear_compile_cache().await,
            RemediationAction::PurgeOldLogs => self.purge_old_logs(),
            RemediationAction::DropPageCaches => self.drop_page_caches().await,
            RemediationAction::LowerMaxNumSeqs => self.lower_max_num_seqs(),
            RemediationAction::RestoreConfigBackup => self.restore_config_backup(),
            RemediationAction::FixPermissions => self.fix_permissions().await,
        }
    }

    async fn restart_service(&self) -> Result<(), ActionError> {
        self.runtime.restart().await?;
        Ok(())
    }
}

/// Logs each action instead of performing it.
pub struct DryRunActions;

#[async_trait]
impl ActionRunner for DryRunActions {
    async fn run(&self, action: RemediationAction) -> Result<String, ActionError> {
        info!(action = action.as_str(), "Dry-run: would run action");
        Ok(format!("dry-run: would run {}", action.as_str()))
    }

    async fn restart_service(&self) -> Result<(), ActionError> {
        info!("Dry-run: would restart service");
        Ok(())
    }
}

fn parse_pids(text: &str) -> Vec<u32> {
    text.lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

/// Remove regular files under `dir` last modified more than `max_age` ago.
///
/// A missing directory removes nothing.
fn purge_older_than(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        let path = entry.path();
        if meta.is_dir() {
            removed += purge_older_than(&path, max_age)?;
        } else if meta.is_file() && meta.modified().is_ok_and(|m| m < cutoff) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Record of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub action: &'static str,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StrategyOutcome {
    Success {
        strategy: &'static str,
        steps: Vec<StepReport>,
        duration_ms: u64,
    },
    Failure {
        strategy: &'static str,
        reason: String,
        steps: Vec<StepReport>,
    },
}

impl StrategyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            Self::Success { strategy, .. } | Self::Failure { strategy, .. } => strategy,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { reason, .. } => Some(reason),
        }
    }
}

/// Executes the strategy for an error kind.
#[async_trait]
pub trait Remediator: Send + Sync {
    async fn execute(&self, kind: ErrorKind) -> StrategyOutcome;
}

pub struct StrategyExecutor {
    actions: Arc<dyn ActionRunner>,
    prober: Arc<dyn Probe>,
    restart_timeout: Duration,
    events: EventBus,
}

impl StrategyExecutor {
    pub fn new(
        actions: Arc<dyn ActionRunner>,
        prober: Arc<dyn Probe>,
        restart_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            actions,
            prober,
            restart_timeout,
            events,
        }
    }
}

#[async_trait]
impl Remediator for StrategyExecutor {
    async fn execute(&self, kind: ErrorKind) -> StrategyOutcome {
        let strategy = RecoveryStrategy::for_kind(kind);
        info!(kind = %kind, strategy = strategy.name, "Executing recovery strategy");
        self.events.emit(
            "strategy_started",
            &json!({ "kind": kind, "strategy": strategy.name }),
        );

        // Run on its own task so a panic inside an action surfaces as a JoinError.
        let task = tokio::spawn(run_strategy(
            strategy,
            self.actions.clone(),
            self.prober.clone(),
            self.restart_timeout,
        ));
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => StrategyOutcome::Failure {
                strategy: strategy.name,
                reason: format!("strategy panicked: {}", panic_message(e.into_panic())),
                steps: Vec::new(),
            },
            Err(e) => StrategyOutcome::Failure {
                strategy: strategy.name,
                reason: format!("strategy task failed: {e}"),
                steps: Vec::new(),
            },
        };

        match &outcome {
            StrategyOutcome::Success { duration_ms, .. } => {
                info!(kind = %kind, strategy = strategy.name, duration_ms, "Recovery strategy succeeded")
            }
            StrategyOutcome::Failure { reason, .. } => {
                warn!(kind = %kind, strategy = strategy.name, %reason, "Recovery strategy failed")
            }
        }
        self.events.emit("strategy_finished", &json!({ "kind": kind, "result": outcome }));
        outcome
    }
}

async fn run_strategy(
    strategy: RecoveryStrategy,
    actions: Arc<dyn ActionRunner>,
    prober: Arc<dyn Probe>,
    restart_timeout: Duration,
) -> StrategyOutcome {
    let started = Instant::now();
    let mut steps = Vec::with_capacity(strategy.actions.len() + 1);

    for &action in strategy.actions {
        match actions.run(action).await {
            Ok(detail) => {
                debug!(action = action.as_str(), %detail, "Action completed");
                steps.push(StepReport {
                    action: action.as_str(),
                    ok: true,
                    detail,
                });
            }
            Err(e) if action.best_effort() => {
                warn!(action = action.as_str(), error = %e, "Best-effort action failed; continuing");
                steps.push(StepReport {
                    action: action.as_str(),
                    ok: false,
                    detail: e.to_string(),
                });
            }
            Err(e) => {
                let reason = format!("{} failed: {e}", action.as_str());
                steps.push(StepReport {
                    action: action.as_str(),
                    ok: false,
                    detail: e.to_string(),
                });
                return StrategyOutcome::Failure {
                    strategy: strategy.name,
                    reason,
                    steps,
                };
            }
        }
    }

    if let Err(e) = actions.restart_service().await {
        steps.push(StepReport {
            action: "restart_service",
            ok: false,
            detail: e.to_string(),
        });
        return StrategyOutcome::Failure {
            strategy: strategy.name,
            reason: format!("restart failed: {e}"),
            steps,
        };
    }
    steps.push(StepReport {
        action: "restart_service",
        ok: true,
        detail: "restart issued".to_string(),
    });

    let poll = HEALTH_POLL_INTERVAL.min(restart_timeout);
    if !wait_until_healthy(prober.as_ref(), restart_timeout, poll).await {
        return StrategyOutcome::Failure {
            strategy: strategy.name,
            reason: format!(
                "service not healthy within {}s of restart",
                restart_timeout.as_secs()
            ),
            steps,
        };
    }

    StrategyOutcome::Success {
        strategy: strategy.name,
        steps,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
