//! The recovery control loop.
//!
//! [`RecoveryMachine`] holds the phase, the active error kind and its
//! attempt counter, and turns loop events into [`Transition`]s. It performs
//! no I/O. [`RecoveryController`] drives it: probe, classify, dispatch,
//! persist every transition, alert, and on escalation roll back and cool
//! down.
//!
//! Phase flow for one failure streak:
//!
//! ```text
//! Healthy --probe fails--> Degraded --dispatch--> Recovering
//! Recovering --success--> Healthy
//! Recovering --failure, budget left--> Recovering (retry)
//! Recovering --failure, budget spent--> Escalated --cooldown--> (probing resumes)
//! ```

use crate::diagnostics::DiagnosticsCollector;
use crate::events::EventBus;
use crate::health::{Probe, ProbeResult};
use crate::metrics;
use crate::notify::AlertQueue;
use crate::resources::{ResourceSampler, threshold_alerts};
use crate::rollback::{Rollback, RollbackOutcome};
use crate::runtime::ServiceRuntime;
use crate::state::{StateError, StateStore};
use crate::strategy::{RecoveryStrategy, Remediator, StrategyOutcome};
use chrono::Utc;
use recovery_common::config::{RecoveryConfig, ThresholdConfig};
use recovery_common::{Alert, Classifier, ErrorKind, Phase, RecoveryStateRecord};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Bound on waiting for background diagnostics at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ControllerError {
    /// The state file could not be written. Fatal: the loop stops.
    #[error(transparent)]
    State(#[from] StateError),
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// A phase change to persist and announce.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: Phase,
    pub record: RecoveryStateRecord,
    pub alert: Alert,
}

/// What a failed attempt leads to.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptVerdict {
    /// Budget left; stay in Recovering and try again.
    Retry(Transition),
    /// Budget spent; the counter has been reset.
    Escalate(Transition),
}

#[derive(Debug, Clone)]
pub struct RecoveryMachine {
    max_attempts: u32,
    phase: Phase,
    kind: Option<ErrorKind>,
    /// Consecutive failed attempts for `kind`. Reset when the kind changes.
    attempts: u32,
    record: RecoveryStateRecord,
}

impl RecoveryMachine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            phase: Phase::Healthy,
            kind: None,
            attempts: 0,
            record: RecoveryStateRecord::initial(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.kind
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn record(&self) -> &RecoveryStateRecord {
        &self.record
    }

    fn transition(&mut self, to: Phase, message: String, alert: Alert) -> Transition {
        let from = self.phase;
        self.phase = to;
        self.record = RecoveryStateRecord {
            timestamp: Utc::now(),
            phase: to,
            error_kind: self.kind,
            attempt_count: self.attempts,
            message,
        };
        Transition {
            from,
            record: self.record.clone(),
            alert,
        }
    }

    /// Adopt `kind` for the streak, resetting the counter when it changes.
    fn adopt(&mut self, kind: ErrorKind) -> bool {
        let switched = self.kind != Some(kind);
        if switched {
            self.kind = Some(kind);
            self.attempts = 0;
        }
        switched
    }

    /// A probe succeeded. Any non-healthy phase returns to Healthy.
    pub fn probe_succeeded(&mut self) -> Option<Transition> {
        if self.phase == Phase::Healthy {
            return None;
        }
        let from = self.phase;
        self.attempts = 0;
        let message = match self.kind {
            Some(kind) => format!("service healthy again (last error: {kind}, was {from})"),
            None => format!("service healthy again (was {from})"),
        };
        let alert = Alert::info("vLLM Service Recovered", message.clone());
        Some(self.transition(Phase::Healthy, message, alert))
    }

    /// A probe failed and the recent logs classified as `kind`.
    ///
    /// Starts a streak from Healthy or Escalated. While Degraded (remediation
    /// disabled) a new transition happens only when the kind changes. While
    /// Recovering the kind is re-adopted without a transition.
    pub fn probe_failed(&mut self, kind: ErrorKind, reason: &str) -> Option<Transition> {
        match self.phase {
            Phase::Healthy | Phase::Escalated => {
                self.kind = Some(kind);
                self.attempts = 0;
            }
            Phase::Degraded => {
                if !self.adopt(kind) {
                    return None;
                }
            }
            Phase::Recovering => {
                if self.adopt(kind) {
                    info!(kind = %kind, "Error kind changed mid-streak; attempt counter reset");
                }
                return None;
            }
        }
        let message = format!("health check failed: {reason}; classified as {kind}");
        let alert = Alert::warning("vLLM Service Degraded", message.clone());
        Some(self.transition(Phase::Degraded, message, alert))
    }

    /// A strategy is about to run. Transitions only on entering Recovering.
    pub fn begin_attempt(&mut self, strategy: &str) -> Option<Transition> {
        if self.phase == Phase::Recovering {
            return None;
        }
        let kind = self.kind.unwrap_or(ErrorKind::Unknown);
        let message = format!(
            "attempt {}/{} for {kind} via {strategy}",
            self.attempts + 1,
            self.max_attempts
        );
        let alert = Alert::warning("vLLM Recovery In Progress", message.clone());
        Some(self.transition(Phase::Recovering, message, alert))
    }

    pub fn attempt_succeeded(&mut self, strategy: &str) -> Transition {
        let kind = self.kind.unwrap_or(ErrorKind::Unknown);
        let attempt = self.attempts + 1;
        self.attempts = 0;
        let message = format!("recovered from {kind} via {strategy} on attempt {attempt}");
        let alert = Alert::info("vLLM Service Recovered", message.clone());
        self.transition(Phase::Healthy, message, alert)
    }

    pub fn attempt_failed(&mut self, reason: &str) -> AttemptVerdict {
        let kind = self.kind.unwrap_or(ErrorKind::Unknown);
        self.attempts += 1;

        if self.attempts >= self.max_attempts {
            let message = format!(
                "{kind}: {} recovery attempts failed (last: {reason}); rolling back to last known-good state",
                self.attempts
            );
            let alert = Alert::critical("vLLM Recovery Escalated", message.clone());
            let transition = self.transition(Phase::Escalated, message, alert);
            self.attempts = 0;
            return AttemptVerdict::Escalate(transition);
        }

        let message = format!(
            "attempt {}/{} for {kind} failed: {reason}; retrying",
            self.attempts, self.max_attempts
        );
        let alert = Alert::warning("vLLM Recovery Attempt Failed", message.clone());
        AttemptVerdict::Retry(self.transition(Phase::Recovering, message, alert))
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Loop timing and policy.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub probe_interval: Duration,
    pub escalation_cooldown: Duration,
    pub max_attempts: u32,
    pub auto_remediate: bool,
    pub retry_immediately: bool,
    pub log_tail_lines: u32,
    pub thresholds: ThresholdConfig,
}

impl MonitorSettings {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            probe_interval: config.monitor.probe_interval(),
            escalation_cooldown: config.monitor.escalation_cooldown(),
            max_attempts: config.monitor.max_attempts,
            auto_remediate: config.monitor.auto_remediate,
            retry_immediately: config.monitor.retry_immediately,
            log_tail_lines: config.monitor.log_tail_lines,
            thresholds: config.thresholds.clone(),
        }
    }
}

/// External collaborators the loop talks to.
pub struct Collaborators {
    pub probe: Arc<dyn Probe>,
    pub runtime: Arc<dyn ServiceRuntime>,
    pub remediator: Arc<dyn Remediator>,
    pub diagnostics: Arc<dyn DiagnosticsCollector>,
    pub rollback: Arc<dyn Rollback>,
    /// Transition and threshold alerts; delivery never blocks the loop.
    pub alerts: AlertQueue,
    /// Resource sampler for threshold alerts after healthy probes.
    pub sampler: Option<Arc<dyn ResourceSampler>>,
}

/// When the loop should tick next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Wait(Duration),
    Now,
}

pub struct RecoveryController {
    machine: RecoveryMachine,
    settings: MonitorSettings,
    classifier: Classifier,
    deps: Collaborators,
    state: Arc<StateStore>,
    events: EventBus,
    background: JoinSet<()>,
}

impl RecoveryController {
    pub fn new(
        settings: MonitorSettings,
        classifier: Classifier,
        deps: Collaborators,
        state: Arc<StateStore>,
        events: EventBus,
    ) -> Self {
        Self {
            machine: RecoveryMachine::new(settings.max_attempts),
            settings,
            classifier,
            deps,
            state,
            events,
            background: JoinSet::new(),
        }
    }

    #[cfg(test)]
    pub fn machine(&self) -> &RecoveryMachine {
        &self.machine
    }

    /// Run until `shutdown` turns true or its sender is dropped.
    ///
    /// Shutdown interrupts the inter-probe sleep and the escalation cooldown
    /// immediately; a strategy already running is allowed to finish.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        self.state.persist(self.machine.record().clone())?;
        metrics::set_phase(self.machine.phase());
        info!(
            interval_secs = self.settings.probe_interval.as_secs(),
            max_attempts = self.settings.max_attempts,
            auto_remediate = self.settings.auto_remediate,
            "Recovery controller started"
        );

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            let wait = match self.tick().await {
                Ok(NextStep::Now) => continue,
                Ok(NextStep::Wait(wait)) => wait,
                Err(e) => break Err(e),
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Shutdown requested");
                    break Ok(());
                }
            }
        };

        self.drain_background().await;
        info!("Recovery controller stopped");
        result
    }

    /// One probe and everything it triggers.
    pub async fn tick(&mut self) -> Result<NextStep, ControllerError> {
        while self.background.try_join_next().is_some() {}

        let result = self.deps.probe.probe().await;
        metrics::record_probe(result.healthy, result.response_time());

        if result.healthy {
            if let Some(transition) = self.machine.probe_succeeded() {
                self.apply(transition)?;
            }
            self.check_thresholds(&result).await;
            return Ok(NextStep::Wait(self.settings.probe_interval));
        }

        self.handle_failure(&result).await
    }

    async fn handle_failure(&mut self, result: &ProbeResult) -> Result<NextStep, ControllerError> {
        let reason = result.reason_or_default();
        let streak_start = matches!(self.machine.phase(), Phase::Healthy | Phase::Escalated);
        let kind = self.classify_recent_logs().await;
        warn!(kind = %kind, %reason, phase = %self.machine.phase(), "Health check failed");

        if streak_start {
            self.spawn_diagnostics(kind);
        }
        if let Some(transition) = self.machine.probe_failed(kind, reason) {
            self.apply(transition)?;
        }

        if !self.settings.auto_remediate {
            debug!(kind = %kind, "Auto-remediation disabled; not executing strategy");
            return Ok(NextStep::Wait(self.settings.probe_interval));
        }

        let kind = self.machine.kind().unwrap_or(kind);
        let strategy = RecoveryStrategy::for_kind(kind);
        if let Some(transition) = self.machine.begin_attempt(strategy.name) {
            self.apply(transition)?;
        }

        let outcome = self.deps.remediator.execute(kind).await;
        metrics::record_attempt(kind, outcome.is_success());

        match outcome {
            StrategyOutcome::Success { strategy, .. } => {
                let transition = self.machine.attempt_succeeded(strategy);
                self.apply(transition)?;
                Ok(NextStep::Wait(self.settings.probe_interval))
            }
            StrategyOutcome::Failure { reason, .. } => match self.machine.attempt_failed(&reason) {
                AttemptVerdict::Retry(transition) => {
                    self.apply(transition)?;
                    if self.settings.retry_immediately {
                        Ok(NextStep::Now)
                    } else {
                        Ok(NextStep::Wait(self.settings.probe_interval))
                    }
                }
                AttemptVerdict::Escalate(transition) => {
                    self.apply(transition)?;
                    metrics::record_escalation(kind);
                    self.events.emit(
                        "escalation",
                        &json!({ "kind": kind, "cooldown_secs": self.settings.escalation_cooldown.as_secs() }),
                    );
                    self.roll_back(kind).await;
                    Ok(NextStep::Wait(self.settings.escalation_cooldown))
                }
            },
        }
    }

    /// Classify the service's own recent logs. The probe's transport error
    /// is deliberately not part of the input.
    async fn classify_recent_logs(&self) -> ErrorKind {
        match self.deps.runtime.recent_logs(self.settings.log_tail_lines).await {
            Ok(logs) => self.classifier.classify(&logs),
            Err(e) => {
                warn!(error = %e, "Could not read service logs; classifying as unknown");
                ErrorKind::Unknown
            }
        }
    }

    fn spawn_diagnostics(&mut self, kind: ErrorKind) {
        let bundle = self.deps.diagnostics.allocate(kind);
        info!(bundle = %bundle, kind = %kind, "Collecting diagnostics");
        self.events
            .emit("diagnostics_started", &json!({ "bundle": bundle, "kind": kind }));
        let collector = self.deps.diagnostics.clone();
        self.background.spawn(async move {
            collector.collect(bundle, kind).await;
        });
    }

    async fn roll_back(&self, kind: ErrorKind) {
        match self.deps.rollback.restore_last_known_good().await {
            Ok(RollbackOutcome::Restored { output }) => {
                info!(kind = %kind, "Rollback completed");
                self.events
                    .emit("rollback", &json!({ "kind": kind, "result": "restored", "output": output }));
            }
            Ok(RollbackOutcome::NotConfigured) => {
                self.events
                    .emit("rollback", &json!({ "kind": kind, "result": "not_configured" }));
            }
            Err(e) => {
                error!(kind = %kind, error = %e, "Rollback failed");
                self.events.emit(
                    "rollback",
                    &json!({ "kind": kind, "result": "failed", "error": e.to_string() }),
                );
                self.deps
                    .alerts
                    .send(Alert::critical("vLLM Rollback Failed", e.to_string()));
            }
        }
    }

    /// Persist, publish and announce one transition.
    fn apply(&mut self, transition: Transition) -> Result<(), ControllerError> {
        let Transition {
            from,
            record,
            alert,
        } = transition;

        self.state.persist(record.clone())?;
        metrics::set_phase(record.phase);
        info!(
            from = %from,
            to = %record.phase,
            kind = record.error_kind.map(|k| k.as_str()).unwrap_or("-"),
            attempts = record.attempt_count,
            "{}",
            record.message
        );
        self.events.emit(
            "transition",
            &json!({
                "from": from,
                "to": record.phase,
                "error_kind": record.error_kind,
                "attempt_count": record.attempt_count,
                "message": record.message,
            }),
        );
        self.deps.alerts.send(alert);
        Ok(())
    }

    async fn check_thresholds(&self, probe: &ProbeResult) {
        if !self.settings.thresholds.enabled {
            return;
        }
        let Some(sampler) = &self.deps.sampler else {
            return;
        };
        let snapshot = sampler.sample().await;
        for problem in &snapshot.errors {
            debug!(%problem, "Resource sampling step failed");
        }
        for alert in threshold_alerts(&snapshot, Some(probe.response_time()), &self.settings.thresholds) {
            self.deps.alerts.send_throttled(alert);
        }
    }

    /// Wait for pending diagnostics and queued alerts, each bounded by [`DRAIN_TIMEOUT`].
    async fn drain_background(&mut self) {
        if !self.background.is_empty() {
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while self.background.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Abandoning unfinished diagnostics collection");
                self.background.abort_all();
            }
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, self.deps.alerts.flush()).await.is_err() {
            warn!("Alerts still undelivered at shutdown");
        }
    }
}
