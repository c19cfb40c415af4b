//! vLLM Recovery Controller
//!
//! Watches a vLLM systemd unit, classifies failures from its logs, runs
//! the matching remediation strategy and escalates to rollback once the
//! per-kind attempt budget is spent.

#![forbid(unsafe_code)]

mod command;
mod controller;
mod diagnostics;
mod events;
#[cfg(test)]
mod fakes;
mod health;
mod history;
mod http_api;
mod metrics;
mod notify;
mod resources;
mod rollback;
mod runtime;
mod service_config;
mod state;
mod strategy;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use recovery_common::util::truncate;
use recovery_common::{ErrorKind, LoadedConfig, LogConfig, RecoveryConfig, SAMPLE_LOGS, init_logging};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

use controller::{Collaborators, MonitorSettings, RecoveryController};
use diagnostics::FsDiagnostics;
use events::EventBus;
use health::{AssumeHealthy, HealthProber, Probe, check_generation, check_models_endpoint};
use history::HistoryLog;
use notify::{AlertQueue, Notifier};
use resources::{ResourceSampler, SystemSampler, generation_alert, threshold_alerts};
use rollback::{CommandRollback, DryRunRollback, Rollback};
use runtime::{ServiceRuntime, SystemdRuntime};
use state::StateStore;
use strategy::{
    ActionRunner, ActionSettings, DryRunActions, RecoveryStrategy, Remediator, StrategyExecutor,
    SystemActions,
};

#[derive(Parser)]
#[command(name = "recovery")]
#[command(author, version, about = "Health-driven error recovery for vLLM services")]
struct Cli {
    /// Configuration file (default: /etc/vllm-recovery/recovery.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recovery loop until SIGINT/SIGTERM
    Monitor {
        /// Serve /health, /status and /metrics on this port
        #[arg(long)]
        http_port: Option<u16>,

        /// Log remediation actions instead of performing them
        #[arg(long)]
        dry_run: bool,

        /// Classify and alert, but never execute strategies
        #[arg(long)]
        no_remediate: bool,
    },

    /// Probe once, classify recent logs and report resources as JSON
    Diagnose,

    /// Run the recovery strategy for one error kind
    Recover {
        /// Error kind, e.g. CudaOutOfMemory or cuda_out_of_memory
        kind: ErrorKind,

        #[arg(long)]
        dry_run: bool,
    },

    /// Print the last persisted recovery state
    Status {
        /// Also show the last N transitions
        #[arg(long, value_name = "N")]
        history: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Self-test classification and a dry-run strategy
    Test,

    /// Print the effective configuration with value sources
    Config {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = RecoveryConfig::load(cli.config.as_deref())?;

    let level = match cli.verbose {
        0 => loaded.config.general.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let log_config = LogConfig::from_env(&level)
        .with_json(cli.json_logs || loaded.config.general.log_json)
        .with_dir(loaded.config.general.log_dir.as_ref());
    let _guards = init_logging(&log_config)?;

    match cli.command {
        Commands::Monitor {
            http_port,
            dry_run,
            no_remediate,
        } => run_monitor(loaded.config, http_port, dry_run, no_remediate).await,
        Commands::Diagnose => run_diagnose(&loaded.config).await,
        Commands::Recover { kind, dry_run } => run_recover(&loaded.config, kind, dry_run).await,
        Commands::Status { history, json } => run_status(&loaded.config, history, json),
        Commands::Test => run_self_test(&loaded.config).await,
        Commands::Config { json } => print_config(&loaded, json),
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn build_runtime(config: &RecoveryConfig) -> Arc<dyn ServiceRuntime> {
    Arc::new(SystemdRuntime::new(
        config.service.unit.clone(),
        Duration::from_secs(config.service.command_timeout_secs),
    ))
}

fn build_prober(config: &RecoveryConfig, runtime: Arc<dyn ServiceRuntime>) -> Arc<dyn Probe> {
    Arc::new(HealthProber::new(
        runtime,
        config.service.health_url.clone(),
        config.monitor.health_timeout(),
    ))
}

fn build_sampler(config: &RecoveryConfig) -> Arc<dyn ResourceSampler> {
    Arc::new(SystemSampler::new(
        config.thresholds.disk_path.clone(),
        Duration::from_secs(config.diagnostics.step_timeout_secs),
    ))
}

fn build_actions(
    config: &RecoveryConfig,
    runtime: Arc<dyn ServiceRuntime>,
    dry_run: bool,
) -> Arc<dyn ActionRunner> {
    if dry_run || config.remediation.dry_run {
        info!("Dry-run mode: remediation actions will only be logged");
        Arc::new(DryRunActions)
    } else {
        Arc::new(SystemActions::new(runtime, ActionSettings::from_config(config)))
    }
}

/// Dry-run covers rollback too: escalation only logs the command.
fn build_rollback(config: &RecoveryConfig, dry_run: bool) -> Arc<dyn Rollback> {
    if dry_run || config.remediation.dry_run {
        Arc::new(DryRunRollback::new(config.rollback.command.clone()))
    } else {
        Arc::new(CommandRollback::new(
            config.rollback.command.clone(),
            Duration::from_secs(config.rollback.timeout_secs),
        ))
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run_monitor(
    config: RecoveryConfig,
    http_port: Option<u16>,
    dry_run: bool,
    no_remediate: bool,
) -> Result<()> {
    let classifier = config.classifier()?;
    let runtime = build_runtime(&config);
    runtime
        .preflight()
        .await
        .context("service runtime is not available")?;

    let events = EventBus::default();
    let probe = build_prober(&config, runtime.clone());
    let sampler = build_sampler(&config);
    let remediator = Arc::new(StrategyExecutor::new(
        build_actions(&config, runtime.clone(), dry_run),
        probe.clone(),
        config.monitor.restart_timeout(),
        events.clone(),
    ));
    let diagnostics = Arc::new(FsDiagnostics::new(
        config.diagnostics.dir.clone(),
        Duration::from_secs(config.diagnostics.step_timeout_secs),
        config.diagnostics.keep_bundles,
        config.monitor.log_tail_lines,
        runtime.clone(),
        sampler.clone(),
    ));
    let rollback = build_rollback(&config, dry_run);
    let notifier = Notifier::from_config(&config.alerts).with_events(events.clone());
    info!(sinks = ?notifier.sink_names(), "Alert sinks configured");

    let history = config.monitor.history_file.clone().map(HistoryLog::new);
    let state = Arc::new(StateStore::new(config.monitor.state_file.clone(), history));
    info!(state_file = %state.path().display(), "Persisting recovery state");

    let mut settings = MonitorSettings::from_config(&config);
    if no_remediate {
        settings.auto_remediate = false;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let server = match http_port.or(config.monitor.http_port) {
        Some(port) => {
            let http_state = http_api::HttpState {
                status: state.subscribe(),
                version: env!("CARGO_PKG_VERSION"),
                started_at: Instant::now(),
                pid: std::process::id(),
            };
            Some(
                http_api::start_server(port, http_state, shutdown_rx.clone())
                    .await
                    .with_context(|| format!("failed to bind HTTP port {port}"))?,
            )
        }
        None => None,
    };

    let deps = Collaborators {
        probe,
        runtime,
        remediator,
        diagnostics,
        rollback,
        alerts: AlertQueue::spawn(notifier),
        sampler: Some(sampler),
    };
    let mut controller = RecoveryController::new(settings, classifier, deps, state, events);
    let result = controller.run(shutdown_rx).await;

    if let Some(mut server) = server {
        if tokio::time::timeout(Duration::from_secs(5), &mut server).await.is_err() {
            server.abort();
        }
    }

    result.context("recovery controller stopped")
}

async fn run_diagnose(config: &RecoveryConfig) -> Result<()> {
    let classifier = config.classifier()?;
    let runtime = build_runtime(config);
    let probe = build_prober(config, runtime.clone()).probe().await;

    let (kind, log_error) = match runtime.recent_logs(config.monitor.log_tail_lines).await {
        Ok(logs) => (classifier.classify(&logs), None),
        Err(e) => (ErrorKind::Unknown, Some(e.to_string())),
    };
    let resources = build_sampler(config).sample().await;
    let models = match config.service.models_url.as_deref() {
        Some(url) => Some(
            check_models_endpoint(
                url,
                config.service.api_key.as_deref(),
                config.monitor.health_timeout(),
            )
            .await,
        ),
        None => None,
    };
    // Slow completions must still finish so their latency can be reported.
    let generation_timeout = config.monitor.health_timeout()
        + Duration::from_secs_f64(config.thresholds.generation_time_secs);
    let generation = match config.service.completions_url.as_deref() {
        Some(url) if probe.healthy => Some(
            check_generation(
                url,
                &config.service.generation_model,
                config.service.api_key.as_deref(),
                generation_timeout,
            )
            .await,
        ),
        _ => None,
    };

    let mut alerts = threshold_alerts(&resources, Some(probe.response_time()), &config.thresholds);
    alerts.extend(
        generation
            .as_ref()
            .filter(|check| check.ok)
            .and_then(|check| generation_alert(check.response_time(), &config.thresholds)),
    );

    let report = json!({
        "unit": runtime.unit(),
        "probe": probe,
        "classification": {
            "error_kind": kind,
            "strategy": RecoveryStrategy::for_kind(kind).name,
            "log_error": log_error,
        },
        "resources": resources,
        "models": models,
        "generation": generation,
        "threshold_alerts": alerts,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_recover(config: &RecoveryConfig, kind: ErrorKind, dry_run: bool) -> Result<()> {
    let runtime = build_runtime(config);
    let probe: Arc<dyn Probe> = if dry_run {
        Arc::new(AssumeHealthy)
    } else {
        build_prober(config, runtime.clone())
    };
    let executor = StrategyExecutor::new(
        build_actions(config, runtime, dry_run),
        probe,
        config.monitor.restart_timeout(),
        EventBus::default(),
    );

    let outcome = executor.execute(kind).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if let Some(reason) = outcome.failure_reason() {
        bail!("recovery strategy {} failed: {}", outcome.strategy(), reason);
    }
    Ok(())
}

fn run_status(config: &RecoveryConfig, history: Option<usize>, json: bool) -> Result<()> {
    let path = &config.monitor.state_file;
    let Some(record) = StateStore::load(path)? else {
        bail!("no recovery state found at {}", path.display());
    };

    let transitions = match (history, &config.monitor.history_file) {
        (Some(n), Some(file)) => HistoryLog::new(file)
            .read_last(n)
            .with_context(|| format!("failed to read history {}", file.display()))?,
        _ => Vec::new(),
    };

    if json {
        let output = json!({ "state": record, "history": transitions });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Phase:       {}", record.phase);
    println!(
        "Error kind:  {}",
        record.error_kind.map_or("-", |k| k.as_str())
    );
    println!("Attempts:    {}", record.attempt_count);
    println!("Updated:     {}", record.timestamp.to_rfc3339());
    println!("Message:     {}", record.message);
    if !transitions.is_empty() {
        println!();
        println!("Recent transitions:");
        for t in &transitions {
            println!(
                "  {}  {:<10} {:<24} {}",
                t.timestamp.format("%Y-%m-%d %H:%M:%S"),
                t.phase.as_str(),
                t.error_kind.map_or("-", |k| k.as_str()),
                truncate(&t.message, 80)
            );
        }
    }
    Ok(())
}

async fn run_self_test(config: &RecoveryConfig) -> Result<()> {
    let classifier = config.classifier()?;
    let mut failures = 0;
    println!("Classification:");
    for (expected, line) in SAMPLE_LOGS {
        let actual = classifier.classify(line);
        let ok = actual == *expected;
        if !ok {
            failures += 1;
        }
        println!(
            "  {} {:<24} <- {}",
            if ok { "ok  " } else { "FAIL" },
            actual.as_str(),
            truncate(line, 60)
        );
    }

    let executor = StrategyExecutor::new(
        Arc::new(DryRunActions),
        Arc::new(AssumeHealthy),
        Duration::from_secs(5),
        EventBus::default(),
    );
    let outcome = executor.execute(ErrorKind::Unknown).await;
    println!();
    println!(
        "Dry-run strategy {}: {}",
        outcome.strategy(),
        if outcome.is_success() { "ok" } else { "FAIL" }
    );
    if let Some(reason) = outcome.failure_reason() {
        bail!("dry-run strategy failed: {reason}");
    }
    if failures > 0 {
        bail!("{failures} classification self-test(s) failed");
    }
    println!("All self-tests passed");
    Ok(())
}

fn print_config(loaded: &LoadedConfig, json: bool) -> Result<()> {
    let masked = loaded.config.masked();
    if json {
        let output = json!({
            "path": loaded.path,
            "config": masked,
            "overrides": loaded.overrides,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    match &loaded.path {
        Some(path) => println!("# config file: {}", path.display()),
        None => println!("# config file: none (built-in defaults)"),
    }
    for o in &loaded.overrides {
        match &o.detail {
            Some(detail) => println!("# {} <- {} ({})", o.field, o.source, detail),
            None => println!("# {} <- {}", o.field, o.source),
        }
    }
    print!("{}", toml::to_string_pretty(&masked)?);
    Ok(())
}
