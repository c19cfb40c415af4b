//! Prometheus metrics for the recovery loop.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use recovery_common::{ErrorKind, Phase, Severity};
use std::sync::Once;
use std::time::Duration;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref PROBES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("vllm_recovery_probes_total", "Health probes by outcome"),
        &["outcome"],
    )
    .expect("metric definition is valid");

    pub static ref PROBE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "vllm_recovery_probe_duration_seconds",
            "Health probe latency",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["outcome"],
    )
    .expect("metric definition is valid");

    pub static ref RECOVERY_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("vllm_recovery_attempts_total", "Remediation attempts by kind and result"),
        &["kind", "outcome"],
    )
    .expect("metric definition is valid");

    pub static ref ESCALATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("vllm_recovery_escalations_total", "Escalations by error kind"),
        &["kind"],
    )
    .expect("metric definition is valid");

    pub static ref ALERTS_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("vllm_recovery_alerts_total", "Alerts dispatched by severity"),
        &["severity"],
    )
    .expect("metric definition is valid");

    pub static ref PHASE: IntGauge = IntGauge::new(
        "vllm_recovery_phase",
        "Current phase (0 healthy, 1 degraded, 2 recovering, 3 escalated)",
    )
    .expect("metric definition is valid");
}

static REGISTER: Once = Once::new();

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: [Box<dyn prometheus::core::Collector>; 6] = [
            Box::new(PROBES_TOTAL.clone()),
            Box::new(PROBE_LATENCY.clone()),
            Box::new(RECOVERY_ATTEMPTS.clone()),
            Box::new(ESCALATIONS.clone()),
            Box::new(ALERTS_SENT.clone()),
            Box::new(PHASE.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!("Failed to register metric: {}", e);
            }
        }
    });
}

/// Render [`REGISTRY`] in the text exposition format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    register_metrics();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

fn outcome_label(ok: bool) -> &'static str {
    if ok { "success" } else { "failure" }
}

pub fn record_probe(healthy: bool, latency: Duration) {
    let outcome = outcome_label(healthy);
    PROBES_TOTAL.with_label_values(&[outcome]).inc();
    PROBE_LATENCY
        .with_label_values(&[outcome])
        .observe(latency.as_secs_f64());
}

pub fn record_attempt(kind: ErrorKind, ok: bool) {
    RECOVERY_ATTEMPTS
        .with_label_values(&[kind.as_str(), outcome_label(ok)])
        .inc();
}

pub fn record_escalation(kind: ErrorKind) {
    ESCALATIONS.with_label_values(&[kind.as_str()]).inc();
}

pub fn record_alert(severity: Severity) {
    ALERTS_SENT.with_label_values(&[severity.as_str()]).inc();
}

pub fn set_phase(phase: Phase) {
    PHASE.set(phase.ordinal());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_output_carries_recorded_series() {
        record_probe(false, Duration::from_millis(120));
        record_attempt(ErrorKind::CudaOutOfMemory, false);
        record_escalation(ErrorKind::CudaOutOfMemory);
        record_alert(Severity::Critical);
        set_phase(Phase::Escalated);

        let text = encode_metrics().unwrap();
        assert!(text.contains("# HELP vllm_recovery_probes_total"));
        assert!(text.contains("vllm_recovery_probes_total{outcome=\"failure\"}"));
        assert!(text.contains(
            "vllm_recovery_attempts_total{kind=\"cuda_out_of_memory\",outcome=\"failure\"}"
        ));
        assert!(text.contains("vllm_recovery_escalations_total{kind=\"cuda_out_of_memory\"}"));
        assert!(text.contains("vllm_recovery_alerts_total{severity=\"critical\"}"));
        assert!(text.contains("vllm_recovery_phase"));
    }

    #[test]
    fn register_is_idempotent() {
        register_metrics();
        register_metrics();
        assert!(encode_metrics().is_ok());
    }
}
