//! Configuration for the recovery controller.
//!
//! Values come from three layers, later layers winning:
//! - built-in defaults
//! - the TOML file (`--config` or [`DEFAULT_CONFIG_PATH`] when present)
//! - `VLLM_RECOVERY_*` environment variables
//!
//! Every error found while loading is reported together at startup.

pub mod env;
pub mod source;

pub use env::{ENV_PREFIX, EnvError, EnvParser, expand_home, parse_duration};
pub use source::{ConfigSource, ConfigValueSource, Sourced};

use crate::classify::{Classifier, RuleSpec};
use crate::errors::ConfigError;
use crate::util::{mask_secret, mask_url};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System-wide config file consulted when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vllm-recovery/recovery.toml";

/// Complete controller configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub general: GeneralConfig,
    pub service: ServiceConfig,
    pub monitor: MonitorConfig,
    pub diagnostics: DiagnosticsConfig,
    pub remediation: RemediationConfig,
    pub rollback: RollbackConfig,
    pub alerts: AlertConfig,
    pub thresholds: ThresholdConfig,
    pub classification: ClassificationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Directory for the daily rolling log file. Console only when unset.
    pub log_dir: Option<PathBuf>,
    /// Emit JSON log lines.
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            log_json: false,
        }
    }
}

/// The managed inference service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// systemd unit name.
    pub unit: String,
    pub health_url: String,
    /// OpenAI-compatible models listing, queried by `diagnose`.
    pub models_url: Option<String>,
    /// Chat completions endpoint used for the generation test in `diagnose`.
    pub completions_url: Option<String>,
    /// Model name sent with the generation test.
    pub generation_model: String,
    /// Bearer token for the OpenAI-compatible endpoints.
    pub api_key: Option<String>,
    /// Environment file holding tunables such as `GPU_MEMORY_UTILIZATION`.
    pub env_file: PathBuf,
    /// Directory of known-good env file backups, newest by modification time wins.
    pub config_backup_dir: PathBuf,
    pub log_dir: PathBuf,
    pub compile_cache_dir: PathBuf,
    /// Owner restored on log and cache directories by the permission fix.
    pub user: String,
    /// Timeout for a single systemctl or journalctl invocation.
    pub command_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            unit: "vllm".to_string(),
            health_url: "http://localhost:8000/health".to_string(),
            models_url: Some("http://localhost:8000/v1/models".to_string()),
            completions_url: Some("http://localhost:8000/v1/chat/completions".to_string()),
            generation_model: "qwen3".to_string(),
            api_key: None,
            env_file: PathBuf::from("/etc/vllm/vllm.env"),
            config_backup_dir: PathBuf::from("/var/backups/vllm/config"),
            log_dir: PathBuf::from("/var/log/vllm"),
            compile_cache_dir: expand_home("~/.cache/vllm/torch_compile_cache"),
            user: "vllm".to_string(),
            command_timeout_secs: 30,
        }
    }
}

/// Control loop timing and budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub probe_interval_secs: u64,
    pub health_timeout_secs: u64,
    /// Failed recovery attempts per error kind before escalating.
    pub max_attempts: u32,
    pub escalation_cooldown_secs: u64,
    /// How long a strategy waits for the service to become healthy after restart.
    pub restart_timeout_secs: u64,
    pub auto_remediate: bool,
    /// Retry a failed strategy without waiting one probe interval.
    pub retry_immediately: bool,
    pub state_file: PathBuf,
    /// Append-only JSONL transition history. Disabled when unset.
    pub history_file: Option<PathBuf>,
    /// Journal lines fed to the classifier.
    pub log_tail_lines: u32,
    /// Port for the status HTTP server. Disabled when unset.
    pub http_port: Option<u16>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            health_timeout_secs: 10,
            max_attempts: 3,
            escalation_cooldown_secs: 300,
            restart_timeout_secs: 300,
            auto_remediate: true,
            retry_immediately: false,
            state_file: PathBuf::from("/var/lib/vllm-recovery/state.json"),
            history_file: Some(PathBuf::from("/var/lib/vllm-recovery/history.jsonl")),
            log_tail_lines: 200,
            http_port: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Parent directory for timestamped bundles.
    pub dir: PathBuf,
    /// Bound on each collection step.
    pub step_timeout_secs: u64,
    /// Bundles kept; older ones are pruned on allocation. Zero keeps everything.
    pub keep_bundles: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/vllm-recovery/diagnostics"),
            step_timeout_secs: 30,
            keep_bundles: 50,
        }
    }
}

/// Knobs for the built-in remediation strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    /// Log actions without executing them.
    pub dry_run: bool,
    pub gpu_memory_var: String,
    pub gpu_memory_step: f64,
    pub gpu_memory_floor: f64,
    pub max_num_seqs_var: String,
    pub max_num_seqs_step: u32,
    pub max_num_seqs_floor: u32,
    /// Service logs older than this are purged when the disk is full.
    pub log_retention_days: u32,
    /// Bound on each external action.
    pub action_timeout_secs: u64,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            gpu_memory_var: "GPU_MEMORY_UTILIZATION".to_string(),
            gpu_memory_step: 0.05,
            gpu_memory_floor: 0.5,
            max_num_seqs_var: "MAX_NUM_SEQS".to_string(),
            max_num_seqs_step: 64,
            max_num_seqs_floor: 16,
            log_retention_days: 7,
            action_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Shell command restoring the last known-good deployment. Rollback is
    /// skipped (and logged) when unset.
    pub command: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Slack-compatible incoming webhook.
    pub slack_webhook: Option<String>,
    pub email_recipients: Vec<String>,
    /// Resource alerts with the same title and message are sent once per window.
    pub dedupe_window_secs: u64,
    pub webhook_timeout_secs: u64,
    pub email_timeout_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            slack_webhook: None,
            email_recipients: Vec::new(),
            dedupe_window_secs: 3600,
            webhook_timeout_secs: 10,
            email_timeout_secs: 30,
        }
    }
}

/// Resource thresholds checked after healthy probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub enabled: bool,
    pub gpu_memory_percent: f64,
    pub gpu_temperature_c: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    /// Filesystem whose usage is checked.
    pub disk_path: PathBuf,
    pub response_time_secs: f64,
    /// Slowest acceptable test completion in `diagnose`.
    pub generation_time_secs: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gpu_memory_percent: 95.0,
            gpu_temperature_c: 85.0,
            cpu_percent: 90.0,
            memory_percent: 90.0,
            disk_percent: 85.0,
            disk_path: PathBuf::from("/"),
            response_time_secs: 5.0,
            generation_time_secs: 30.0,
        }
    }
}

/// Ordered classification rules. Empty selects the built-in table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub rules: Vec<RuleSpec>,
}

/// A loaded configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: RecoveryConfig,
    /// The file read, if any.
    pub path: Option<PathBuf>,
    /// Fields overridden from the environment.
    pub overrides: Vec<ConfigValueSource>,
}

impl RecoveryConfig {
    /// Parse a TOML document. `path` is only used in error messages.
    pub fn from_toml_str(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load defaults, the config file and environment overrides, then validate.
    ///
    /// An explicit `path` must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
    /// read only when present.
    pub fn load(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        let env_path = std::env::var(format!("{ENV_PREFIX}CONFIG"))
            .ok()
            .filter(|p| !p.is_empty())
            .map(|p| expand_home(&p));
        let file = match (path, env_path) {
            (Some(p), _) => Some(p.to_path_buf()),
            (None, Some(p)) => Some(p),
            (None, None) => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            }
        };

        let mut config = match &file {
            Some(p) => {
                let contents = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.clone(),
                    source,
                })?;
                Self::from_toml_str(&contents, p)?
            }
            None => Self::default(),
        };

        let mut parser = EnvParser::new();
        let overrides = config.apply_env(&mut parser);
        if parser.has_errors() {
            return Err(ConfigError::Environment(parser.take_errors()));
        }

        config.validate()?;
        tracing::debug!(
            path = ?file,
            overrides = overrides.len(),
            "Configuration loaded"
        );
        Ok(LoadedConfig {
            config,
            path: file,
            overrides,
        })
    }

    /// Overlay `VLLM_RECOVERY_*` variables, returning the fields they set.
    pub fn apply_env(&mut self, parser: &mut EnvParser) -> Vec<ConfigValueSource> {
        let mut sources = Vec::new();
        let s = &mut sources;

        parser
            .get_log_level("LOG_LEVEL", &self.general.log_level)
            .apply_to(&mut self.general.log_level, "general.log_level", s);
        parser
            .get_optional_string("LOG_DIR")
            .map(|v| v.map(|p| expand_home(&p)))
            .apply_to(&mut self.general.log_dir, "general.log_dir", s);
        parser
            .get_bool("LOG_JSON", self.general.log_json)
            .apply_to(&mut self.general.log_json, "general.log_json", s);

        parser
            .get_string("SERVICE_UNIT", &self.service.unit)
            .apply_to(&mut self.service.unit, "service.unit", s);
        parser
            .get_string("HEALTH_URL", &self.service.health_url)
            .apply_to(&mut self.service.health_url, "service.health_url", s);
        parser
            .get_optional_string("MODELS_URL")
            .apply_to(&mut self.service.models_url, "service.models_url", s);
        parser
            .get_optional_string("COMPLETIONS_URL")
            .apply_to(&mut self.service.completions_url, "service.completions_url", s);
        parser
            .get_string("GENERATION_MODEL", &self.service.generation_model)
            .apply_to(&mut self.service.generation_model, "service.generation_model", s);
        parser
            .get_optional_string("API_KEY")
            .apply_to(&mut self.service.api_key, "service.api_key", s);
        let env_file = self.service.env_file.to_string_lossy().into_owned();
        parser
            .get_path("ENV_FILE", &env_file)
            .apply_to(&mut self.service.env_file, "service.env_file", s);

        parser
            .get_duration_secs("PROBE_INTERVAL", self.monitor.probe_interval_secs)
            .apply_to(&mut self.monitor.probe_interval_secs, "monitor.probe_interval_secs", s);
        parser
            .get_duration_secs("HEALTH_TIMEOUT", self.monitor.health_timeout_secs)
            .apply_to(&mut self.monitor.health_timeout_secs, "monitor.health_timeout_secs", s);
        parser
            .get_u32_range("MAX_ATTEMPTS", self.monitor.max_attempts, 1, 100)
            .apply_to(&mut self.monitor.max_attempts, "monitor.max_attempts", s);
        parser
            .get_duration_secs("ESCALATION_COOLDOWN", self.monitor.escalation_cooldown_secs)
            .apply_to(
                &mut self.monitor.escalation_cooldown_secs,
                "monitor.escalation_cooldown_secs",
                s,
            );
        parser
            .get_duration_secs("RESTART_TIMEOUT", self.monitor.restart_timeout_secs)
            .apply_to(&mut self.monitor.restart_timeout_secs, "monitor.restart_timeout_secs", s);
        parser
            .get_bool("AUTO_REMEDIATE", self.monitor.auto_remediate)
            .apply_to(&mut self.monitor.auto_remediate, "monitor.auto_remediate", s);
        parser
            .get_bool("RETRY_IMMEDIATELY", self.monitor.retry_immediately)
            .apply_to(&mut self.monitor.retry_immediately, "monitor.retry_immediately", s);
        let state_file = self.monitor.state_file.to_string_lossy().into_owned();
        parser
            .get_path("STATE_FILE", &state_file)
            .apply_to(&mut self.monitor.state_file, "monitor.state_file", s);
        parser
            .get_optional_string("HISTORY_FILE")
            .map(|v| v.map(|p| expand_home(&p)))
            .apply_to(&mut self.monitor.history_file, "monitor.history_file", s);

        let diagnostics_dir = self.diagnostics.dir.to_string_lossy().into_owned();
        parser
            .get_path("DIAGNOSTICS_DIR", &diagnostics_dir)
            .apply_to(&mut self.diagnostics.dir, "diagnostics.dir", s);

        parser
            .get_bool("DRY_RUN", self.remediation.dry_run)
            .apply_to(&mut self.remediation.dry_run, "remediation.dry_run", s);
        parser
            .get_f64_range("GPU_MEMORY_FLOOR", self.remediation.gpu_memory_floor, 0.05, 1.0)
            .apply_to(&mut self.remediation.gpu_memory_floor, "remediation.gpu_memory_floor", s);

        parser
            .get_optional_string("ROLLBACK_COMMAND")
            .apply_to(&mut self.rollback.command, "rollback.command", s);

        parser
            .get_optional_string("SLACK_WEBHOOK")
            .apply_to(&mut self.alerts.slack_webhook, "alerts.slack_webhook", s);
        parser
            .get_string_list("EMAIL_RECIPIENTS", self.alerts.email_recipients.clone())
            .apply_to(&mut self.alerts.email_recipients, "alerts.email_recipients", s);
        parser
            .get_duration_secs("ALERT_DEDUPE_WINDOW", self.alerts.dedupe_window_secs)
            .apply_to(&mut self.alerts.dedupe_window_secs, "alerts.dedupe_window_secs", s);

        sources
    }

    /// Check value ranges and compile classification rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut invalid = |field: &'static str, reason: String| {
            errors.push(ConfigError::Invalid { field, reason });
        };

        let m = &self.monitor;
        if m.probe_interval_secs == 0 {
            invalid("monitor.probe_interval_secs", "must be at least 1 second".into());
        }
        if m.health_timeout_secs == 0 {
            invalid("monitor.health_timeout_secs", "must be at least 1 second".into());
        } else if m.probe_interval_secs > 0 && m.health_timeout_secs > m.probe_interval_secs {
            // Compared only against a valid interval so a zero interval is reported once.
            invalid(
                "monitor.health_timeout_secs",
                format!(
                    "{}s exceeds the probe interval of {}s",
                    m.health_timeout_secs, m.probe_interval_secs
                ),
            );
        }
        if m.max_attempts == 0 {
            invalid("monitor.max_attempts", "must be at least 1".into());
        }
        if m.restart_timeout_secs == 0 {
            invalid("monitor.restart_timeout_secs", "must be at least 1 second".into());
        }
        if m.log_tail_lines == 0 {
            invalid("monitor.log_tail_lines", "must be at least 1".into());
        }

        let url = &self.service.health_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            invalid("service.health_url", format!("'{url}' is not an http(s) URL"));
        }
        if self.service.unit.trim().is_empty() {
            invalid("service.unit", "must not be empty".into());
        }
        if self.service.command_timeout_secs == 0 {
            invalid("service.command_timeout_secs", "must be at least 1 second".into());
        }

        let r = &self.remediation;
        if !(r.gpu_memory_floor > 0.0 && r.gpu_memory_floor <= 1.0) {
            invalid("remediation.gpu_memory_floor", "must be in (0, 1]".into());
        }
        if !(r.gpu_memory_step > 0.0 && r.gpu_memory_step < 1.0) {
            invalid("remediation.gpu_memory_step", "must be in (0, 1)".into());
        }
        if r.max_num_seqs_floor == 0 {
            invalid("remediation.max_num_seqs_floor", "must be at least 1".into());
        }
        if r.max_num_seqs_step == 0 {
            invalid("remediation.max_num_seqs_step", "must be at least 1".into());
        }
        if r.action_timeout_secs == 0 {
            invalid("remediation.action_timeout_secs", "must be at least 1 second".into());
        }
        if self.diagnostics.step_timeout_secs == 0 {
            invalid("diagnostics.step_timeout_secs", "must be at least 1 second".into());
        }

        let t = &self.thresholds;
        for (field, value) in [
            ("thresholds.gpu_memory_percent", t.gpu_memory_percent),
            ("thresholds.cpu_percent", t.cpu_percent),
            ("thresholds.memory_percent", t.memory_percent),
            ("thresholds.disk_percent", t.disk_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                invalid(field, format!("{value} is not a percentage"));
            }
        }
        if t.response_time_secs <= 0.0 {
            invalid("thresholds.response_time_secs", "must be positive".into());
        }
        if t.generation_time_secs <= 0.0 {
            invalid("thresholds.generation_time_secs", "must be positive".into());
        }

        if let Err(e) = self.classifier() {
            errors.push(e);
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Validation(errors)),
        }
    }

    /// Compile the configured classification rules.
    pub fn classifier(&self) -> Result<Classifier, ConfigError> {
        Classifier::from_specs(&self.classification.rules)
    }

    /// A copy safe to print: credentials and webhook paths are masked.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        copy.service.api_key = copy.service.api_key.as_deref().map(mask_secret);
        copy.alerts.slack_webhook = copy.alerts.slack_webhook.as_deref().map(mask_url);
        copy
    }
}

impl MonitorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn escalation_cooldown(&self) -> Duration {
        Duration::from_secs(self.escalation_cooldown_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }
}

impl AlertConfig {
    pub fn dedupe_window(&self) -> Duration {
        Duration::from_secs(self.dedupe_window_secs)
    }
}
