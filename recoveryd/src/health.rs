//! Health probing of the managed service.
//!
//! A probe first asks the runtime whether the unit is active, then issues a
//! GET against the health URL. Every failure mode (inactive unit, runtime
//! error, transport error, timeout, non-2xx status) normalizes to an
//! unhealthy result; probing never returns an error to the caller.

use crate::runtime::ServiceRuntime;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub healthy: bool,
    /// Why the probe failed. `None` when healthy.
    pub reason: Option<String>,
    /// HTTP status, when the endpoint answered.
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    pub checked_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn healthy(response_time: Duration, status_code: u16) -> Self {
        Self {
            healthy: true,
            reason: None,
            status_code: Some(status_code),
            response_time_ms: duration_ms(response_time),
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(reason: impl Into<String>, response_time: Duration) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
            status_code: None,
            response_time_ms: duration_ms(response_time),
            checked_at: Utc::now(),
        }
    }

    fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn response_time(&self) -> Duration {
        Duration::from_millis(self.response_time_ms)
    }

    pub fn reason_or_default(&self) -> &str {
        self.reason.as_deref().unwrap_or("healthy")
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> ProbeResult;
}

/// Runtime liveness plus HTTP health endpoint.
pub struct HealthProber {
    runtime: Arc<dyn ServiceRuntime>,
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(runtime: Arc<dyn ServiceRuntime>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runtime,
            client: build_client(timeout),
            url: url.into(),
            timeout,
        }
    }

    /// HTTP part of the probe, without the liveness check.
    pub async fn check_endpoint(&self) -> ProbeResult {
        let started = Instant::now();
        let request = self.client.get(&self.url).send();
        match tokio::time::timeout(self.timeout, request).await {
            Err(_) => ProbeResult::unhealthy(
                format!("health check timed out after {}s", self.timeout.as_secs_f64()),
                started.elapsed(),
            ),
            Ok(Err(e)) => ProbeResult::unhealthy(
                format!("health check request failed: {}", describe_reqwest_error(&e)),
                started.elapsed(),
            ),
            Ok(Ok(response)) => {
                let status = response.status();
                let elapsed = started.elapsed();
                if status.is_success() {
                    ProbeResult::healthy(elapsed, status.as_u16())
                } else {
                    ProbeResult::unhealthy(format!("health endpoint returned {status}"), elapsed)
                        .with_status(status.as_u16())
                }
            }
        }
    }
}

#[async_trait]
impl Probe for HealthProber {
    async fn probe(&self) -> ProbeResult {
        let started = Instant::now();
        match self.runtime.is_active().await {
            Ok(true) => {}
            Ok(false) => {
                return ProbeResult::unhealthy(
                    format!("service {} is not active", self.runtime.unit()),
                    started.elapsed(),
                );
            }
            Err(e) => {
                return ProbeResult::unhealthy(
                    format!("liveness check failed: {e}"),
                    started.elapsed(),
                );
            }
        }

        let result = self.check_endpoint().await;
        debug!(
            healthy = result.healthy,
            response_ms = result.response_time_ms,
            reason = result.reason_or_default(),
            "Health probe finished"
        );
        result
    }
}

/// Probe that always reports healthy. Used by dry runs that must not touch the service.
pub struct AssumeHealthy;

#[async_trait]
impl Probe for AssumeHealthy {
    async fn probe(&self) -> ProbeResult {
        ProbeResult::healthy(Duration::ZERO, 200)
    }
}

/// Poll until a probe succeeds or `deadline` elapses.
pub async fn wait_until_healthy(probe: &dyn Probe, deadline: Duration, poll: Duration) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        if probe.probe().await.healthy {
            return true;
        }
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            return false;
        }
        tokio::time::sleep(poll.min(deadline - elapsed)).await;
    }
}

/// Result of querying an OpenAI-compatible endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointCheck {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    pub model_count: Option<usize>,
    pub error: Option<String>,
}

/// GET the models endpoint with an optional bearer token.
pub async fn check_models_endpoint(url: &str, api_key: Option<&str>, timeout: Duration) -> EndpointCheck {
    let client = build_client(timeout);
    let started = Instant::now();
    let mut request = client.get(url);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = match send_checked(request, timeout, started).await {
        Ok(response) => response,
        Err(failed) => return failed,
    };
    let status = response.status();

    let model_count = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body.get("data").and_then(|d| d.as_array()).map(Vec::len));

    EndpointCheck {
        ok: true,
        status_code: Some(status.as_u16()),
        response_time_ms: duration_ms(started.elapsed()),
        model_count,
        error: None,
    }
}

impl EndpointCheck {
    fn failed(error: String, status_code: Option<u16>, started: Instant) -> Self {
        Self {
            ok: false,
            status_code,
            response_time_ms: duration_ms(started.elapsed()),
            model_count: None,
            error: Some(error),
        }
    }

    pub fn response_time(&self) -> Duration {
        Duration::from_millis(self.response_time_ms)
    }
}

/// Send `request`, turning timeouts, transport errors and non-2xx statuses into a failed check.
async fn send_checked(
    request: reqwest::RequestBuilder,
    timeout: Duration,
    started: Instant,
) -> Result<reqwest::Response, EndpointCheck> {
    let response = match tokio::time::timeout(timeout, request.send()).await {
        Err(_) => {
            return Err(EndpointCheck::failed(
                format!("timed out after {}s", timeout.as_secs_f64()),
                None,
                started,
            ));
        }
        Ok(Err(e)) => return Err(EndpointCheck::failed(describe_reqwest_error(&e), None, started)),
        Ok(Ok(response)) => response,
    };
    let status = response.status();
    if !status.is_success() {
        return Err(EndpointCheck::failed(
            format!("returned {status}"),
            Some(status.as_u16()),
            started,
        ));
    }
    Ok(response)
}

/// POST a tiny chat completion and time it end to end.
pub async fn check_generation(
    url: &str,
    model: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> EndpointCheck {
    let client = build_client(timeout);
    let started = Instant::now();
    let mut request = client.post(url).json(&serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "Say 'OK' if you're working."}],
        "max_tokens": 5,
        "temperature": 0.1,
    }));
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = match send_checked(request, timeout, started).await {
        Ok(response) => response,
        Err(failed) => return failed,
    };
    let status = response.status();
    // The body must arrive before the clock stops.
    if let Err(e) = response.bytes().await {
        return EndpointCheck::failed(describe_reqwest_error(&e), Some(status.as_u16()), started);
    }

    EndpointCheck {
        ok: true,
        status_code: Some(status.as_u16()),
        response_time_ms: duration_ms(started.elapsed()),
        model_count: None,
        error: None,
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn describe_reqwest_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    }
}
