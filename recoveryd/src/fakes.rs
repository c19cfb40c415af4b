//! In-memory collaborators for unit tests.

use crate::diagnostics::{BundleId, DiagnosticsCollector};
use crate::health::{Probe, ProbeResult};
use crate::notify::{AlertSink, SinkError};
use crate::rollback::{Rollback, RollbackError, RollbackOutcome};
use crate::runtime::{RuntimeError, ServiceRuntime};
use crate::strategy::{ActionError, ActionRunner, RemediationAction, Remediator, StrategyOutcome};
use async_trait::async_trait;
use recovery_common::{Alert, ErrorKind};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// ---------------------------------------------------------------------------
// Service runtime
// ---------------------------------------------------------------------------

pub struct FakeRuntime {
    active: AtomicBool,
    liveness_error: AtomicBool,
    logs: Mutex<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            liveness_error: AtomicBool::new(false),
            logs: Mutex::new(String::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn fail_liveness(&self, fail: bool) {
        self.liveness_error.store(fail, Ordering::SeqCst);
    }

    pub fn set_logs(&self, logs: &str) {
        *self.logs.lock().unwrap() = logs.to_string();
    }

    /// Mutating calls in order: `start`, `stop`, `restart`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl ServiceRuntime for FakeRuntime {
    fn unit(&self) -> &str {
        "vllm-fake"
    }

    async fn preflight(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn is_active(&self) -> Result<bool, RuntimeError> {
        if self.liveness_error.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed {
                action: "query",
                unit: self.unit().to_string(),
                detail: "bus unavailable".to_string(),
            });
        }
        Ok(self.active.load(Ordering::SeqCst))
    }

    async fn start(&self) -> Result<(), RuntimeError> {
        self.record("start");
        self.set_active(true);
        Ok(())
    }

    async fn stop(&self) -> Result<(), RuntimeError> {
        self.record("stop");
        self.set_active(false);
        Ok(())
    }

    async fn restart(&self) -> Result<(), RuntimeError> {
        self.record("restart");
        self.set_active(true);
        Ok(())
    }

    async fn status_text(&self) -> Result<String, RuntimeError> {
        let state = if self.active.load(Ordering::SeqCst) {
            "active (running)"
        } else {
            "inactive (dead)"
        };
        Ok(format!("● vllm-fake.service\n   Active: {state}\n"))
    }

    async fn recent_logs(&self, _lines: u32) -> Result<String, RuntimeError> {
        Ok(self.logs.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Returns scripted results in order, then repeats the last one.
pub struct ScriptedProbe {
    results: Mutex<VecDeque<ProbeResult>>,
    last: Mutex<Option<ProbeResult>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(results: Vec<ProbeResult>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(result: ProbeResult) -> Self {
        Self::new(vec![result])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.results.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(result) = next {
            *last = Some(result);
        }
        last.clone()
            .unwrap_or_else(|| ProbeResult::unhealthy("no scripted result", Default::default()))
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

pub struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.alerts().into_iter().map(|a| a.title).collect()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, alert: &Alert) -> Result<(), SinkError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Action runner that records calls and fails or panics on request.
pub struct RecordingActions {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<RemediationAction>>,
    panicking: Mutex<HashSet<RemediationAction>>,
    restart_fails: AtomicBool,
}

impl RecordingActions {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            panicking: Mutex::new(HashSet::new()),
            restart_fails: AtomicBool::new(false),
        }
    }

    pub fn fail(&self, action: RemediationAction) {
        self.failing.lock().unwrap().insert(action);
    }

    pub fn panic_on(&self, action: RemediationAction) {
        self.panicking.lock().unwrap().insert(action);
    }

    pub fn fail_restart(&self) {
        self.restart_fails.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionRunner for RecordingActions {
    async fn run(&self, action: RemediationAction) -> Result<String, ActionError> {
        self.calls.lock().unwrap().push(action.as_str().to_string());
        if self.panicking.lock().unwrap().contains(&action) {
            panic!("{} exploded", action.as_str());
        }
        if self.failing.lock().unwrap().contains(&action) {
            return Err(ActionError::Failed(format!("{} refused", action.as_str())));
        }
        Ok(format!("{} done", action.as_str()))
    }

    async fn restart_service(&self) -> Result<(), ActionError> {
        self.calls.lock().unwrap().push("restart_service".to_string());
        if self.restart_fails.load(Ordering::SeqCst) {
            return Err(ActionError::Failed("unit masked".to_string()));
        }
        Ok(())
    }
}

/// Remediator with a fixed result that records the kinds it was asked for.
pub struct FakeRemediator {
    succeed: bool,
    executed: Mutex<Vec<ErrorKind>>,
}

impl FakeRemediator {
    pub fn always(succeed: bool) -> Self {
        Self {
            succeed,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<ErrorKind> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Remediator for FakeRemediator {
    async fn execute(&self, kind: ErrorKind) -> StrategyOutcome {
        self.executed.lock().unwrap().push(kind);
        let strategy = crate::strategy::RecoveryStrategy::for_kind(kind).name;
        if self.succeed {
            StrategyOutcome::Success {
                strategy,
                steps: Vec::new(),
                duration_ms: 1,
            }
        } else {
            StrategyOutcome::Failure {
                strategy,
                reason: "service not healthy within 300s of restart".to_string(),
                steps: Vec::new(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rollback and diagnostics
// ---------------------------------------------------------------------------

pub struct FakeRollback {
    calls: AtomicUsize,
}

impl FakeRollback {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Rollback for FakeRollback {
    async fn restore_last_known_good(&self) -> Result<RollbackOutcome, RollbackError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RollbackOutcome::Restored {
            output: "restored snapshot".to_string(),
        })
    }
}

pub struct FakeDiagnostics {
    allocated: AtomicUsize,
    collected: AtomicUsize,
}

impl FakeDiagnostics {
    pub fn new() -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            collected: AtomicUsize::new(0),
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn collected(&self) -> usize {
        self.collected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagnosticsCollector for FakeDiagnostics {
    fn allocate(&self, kind: ErrorKind) -> BundleId {
        let n = self.allocated.fetch_add(1, Ordering::SeqCst);
        BundleId::from(PathBuf::from(format!("/tmp/fake-bundles/{n}-{kind}")))
    }

    async fn collect(&self, _bundle: BundleId, _kind: ErrorKind) {
        self.collected.fetch_add(1, Ordering::SeqCst);
    }
}
