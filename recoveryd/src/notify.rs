//! Alert fan-out to operators.
//!
//! The [`Notifier`] hands every alert to each configured [`AlertSink`].
//! Sinks are bounded by their own timeouts and a failing sink only produces
//! a warning; alerting never fails the caller. The control loop talks to an
//! [`AlertQueue`] instead, so a slow sink never delays a restart.

use crate::command::{CommandError, run_command_with_input};
use crate::events::EventBus;
use crate::metrics;
use async_trait::async_trait;
use recovery_common::config::AlertConfig;
use recovery_common::util::mask_url;
use recovery_common::{Alert, Severity};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned HTTP {0}")]
    Status(u16),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("mail exited unsuccessfully: {0}")]
    MailFailed(String),
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Writes alerts to the structured log.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), SinkError> {
        match alert.severity {
            Severity::Info => info!(title = %alert.title, "ALERT: {}", alert.message),
            Severity::Warning => warn!(title = %alert.title, "ALERT: {}", alert.message),
            Severity::Critical => error!(title = %alert.title, "ALERT: {}", alert.message),
        }
        Ok(())
    }
}

/// Posts a Slack-compatible message to an incoming webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.into(),
        }
    }
}

/// Slack attachment payload for `alert`.
pub fn webhook_payload(alert: &Alert) -> serde_json::Value {
    let color = match alert.severity {
        Severity::Info => "good",
        Severity::Warning => "warning",
        Severity::Critical => "danger",
    };
    json!({
        "text": format!("🚨 vLLM Alert: {}", alert.title),
        "attachments": [{
            "color": color,
            "fields": [{
                "title": "Details",
                "value": alert.message,
                "short": false,
            }],
        }],
    })
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .json(&webhook_payload(alert))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status(status.as_u16()));
        }
        debug!(url = %mask_url(&self.url), "Webhook alert delivered");
        Ok(())
    }
}

/// Pipes alerts through the system `mail` command.
pub struct EmailSink {
    recipients: Vec<String>,
    timeout: Duration,
}

impl EmailSink {
    pub fn new(recipients: Vec<String>, timeout: Duration) -> Self {
        Self {
            recipients,
            timeout,
        }
    }
}

pub fn email_body(alert: &Alert) -> String {
    format!(
        "Alert: {}\nDetails: {}\nTime: {}\n",
        alert.title,
        alert.message,
        alert.timestamp.to_rfc3339()
    )
}

#[async_trait]
impl AlertSink for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, alert: &Alert) -> Result<(), SinkError> {
        let subject = format!("vLLM Alert: {}", alert.title);
        let mut args = vec!["-s", subject.as_str()];
        args.extend(self.recipients.iter().map(String::as_str));
        let output =
            run_command_with_input("mail", &args, Some(&email_body(alert)), self.timeout).await?;
        if output.success() {
            Ok(())
        } else {
            Err(SinkError::MailFailed(output.failure_detail()))
        }
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Notifier {
    sinks: Vec<Arc<dyn AlertSink>>,
    dedupe_window: Duration,
    last_sent: Arc<Mutex<HashMap<String, Instant>>>,
    events: Option<EventBus>,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>, dedupe_window: Duration) -> Self {
        Self {
            sinks,
            dedupe_window,
            last_sent: Arc::new(Mutex::new(HashMap::new())),
            events: None,
        }
    }

    /// Log sink plus webhook and email sinks when configured.
    pub fn from_config(config: &AlertConfig) -> Self {
        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink)];
        if let Some(url) = config.slack_webhook.as_deref().filter(|u| !u.is_empty()) {
            sinks.push(Arc::new(WebhookSink::new(
                url,
                Duration::from_secs(config.webhook_timeout_secs),
            )));
        }
        if !config.email_recipients.is_empty() {
            sinks.push(Arc::new(EmailSink::new(
                config.email_recipients.clone(),
                Duration::from_secs(config.email_timeout_secs),
            )));
        }
        Self::new(sinks, Duration::from_secs(config.dedupe_window_secs))
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Deliver `alert` to every sink. Sink failures are logged and dropped.
    pub async fn notify(&self, alert: Alert) {
        metrics::record_alert(alert.severity);
        if let Some(events) = &self.events {
            events.emit("alert", &alert);
        }
        for sink in &self.sinks {
            if let Err(e) = sink.send(&alert).await {
                warn!(sink = sink.name(), title = %alert.title, error = %e, "Failed to deliver alert");
            }
        }
    }

    /// Like [`Notifier::notify`], but an alert with the same title and
    /// message is sent at most once per dedupe window. Returns whether it was sent.
    pub async fn notify_throttled(&self, alert: Alert) -> bool {
        let key = format!("{}:{}", alert.title, alert.message);
        let now = Instant::now();
        {
            let mut last_sent = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = last_sent.get(&key) {
                if now.duration_since(*previous) < self.dedupe_window {
                    debug!(title = %alert.title, "Suppressing repeated alert");
                    return false;
                }
            }
            last_sent.insert(key, now);
        }
        self.notify(alert).await;
        true
    }
}

enum Queued {
    Alert(Alert),
    Throttled(Alert),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget front for a [`Notifier`].
///
/// Alerts are delivered in queue order by one background task. The task
/// exits once every handle has been dropped.
#[derive(Clone)]
pub struct AlertQueue {
    tx: mpsc::UnboundedSender<Queued>,
}

impl AlertQueue {
    /// Start the delivery task. Must be called inside a Tokio runtime.
    pub fn spawn(notifier: Notifier) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Queued::Alert(alert) => notifier.notify(alert).await,
                    Queued::Throttled(alert) => {
                        notifier.notify_throttled(alert).await;
                    }
                    Queued::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Alert delivery task stopped");
        });
        Self { tx }
    }

    pub fn send(&self, alert: Alert) {
        self.enqueue(Queued::Alert(alert));
    }

    /// Queue an alert subject to the notifier's dedupe window.
    pub fn send_throttled(&self, alert: Alert) {
        self.enqueue(Queued::Throttled(alert));
    }

    /// Wait until everything queued before this call has reached the sinks.
    pub async fn flush(&self) {
        let (done, delivered) = oneshot::channel();
        if self.tx.send(Queued::Flush(done)).is_ok() {
            let _ = delivered.await;
        }
    }

    fn enqueue(&self, item: Queued) {
        if self.tx.send(item).is_err() {
            warn!("Alert delivery task is gone; dropping alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::RecordingSink;
    use axum::routing::post;
    use axum::{Json, Router};

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _alert: &Alert) -> Result<(), SinkError> {
            Err(SinkError::Status(500))
        }
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_others() {
        let recorder = Arc::new(RecordingSink::new());
        let notifier = Notifier::new(
            vec![Arc::new(FailingSink), recorder.clone()],
            Duration::from_secs(60),
        );
        notifier.notify(Alert::critical("Escalated", "rollback invoked")).await;
        assert_eq!(recorder.titles(), vec!["Escalated"]);
    }

    struct StallingSink;

    #[async_trait]
    impl AlertSink for StallingSink {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn send(&self, _alert: &Alert) -> Result<(), SinkError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_returns_immediately_and_delivers_in_order() {
        let recorder = Arc::new(RecordingSink::new());
        let queue = AlertQueue::spawn(Notifier::new(
            vec![Arc::new(StallingSink), recorder.clone()],
            Duration::from_secs(3600),
        ));
        let started = Instant::now();

        queue.send(Alert::warning("vLLM Service Degraded", "down"));
        queue.send(Alert::warning("vLLM Recovery In Progress", "attempt 1/3"));
        queue.send_throttled(Alert::warning("Disk Usage High", "91%"));
        queue.send_throttled(Alert::warning("Disk Usage High", "91%"));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(recorder.alerts().is_empty());

        queue.flush().await;
        assert_eq!(
            recorder.titles(),
            vec!["vLLM Service Degraded", "vLLM Recovery In Progress", "Disk Usage High"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_suppresses_repeats_within_window() {
        let recorder = Arc::new(RecordingSink::new());
        let notifier = Notifier::new(vec![recorder.clone()], Duration::from_secs(3600));

        assert!(notifier.notify_throttled(Alert::warning("Disk Usage High", "91%")).await);
        assert!(!notifier.notify_throttled(Alert::warning("Disk Usage High", "91%")).await);
        // Different message is a different key.
        assert!(notifier.notify_throttled(Alert::warning("Disk Usage High", "92%")).await);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(notifier.notify_throttled(Alert::warning("Disk Usage High", "91%")).await);
        assert_eq!(recorder.alerts().len(), 3);
    }

    #[test]
    fn from_config_adds_configured_sinks() {
        let mut config = AlertConfig::default();
        assert_eq!(Notifier::from_config(&config).sink_names(), vec!["log"]);

        config.slack_webhook = Some("https://hooks.example.com/T000/B000".into());
        config.email_recipients = vec!["oncall@example.com".into()];
        assert_eq!(
            Notifier::from_config(&config).sink_names(),
            vec!["log", "webhook", "email"]
        );
    }

    #[test]
    fn payload_and_body_formats() {
        let alert = Alert::critical("Recovery Escalated", "3 attempts failed");
        let payload = webhook_payload(&alert);
        assert_eq!(payload["text"], "🚨 vLLM Alert: Recovery Escalated");
        assert_eq!(payload["attachments"][0]["color"], "danger");
        assert_eq!(payload["attachments"][0]["fields"][0]["value"], "3 attempts failed");
        assert_eq!(webhook_payload(&Alert::info("ok", "")).pointer("/attachments/0/color").unwrap(), "good");

        let body = email_body(&alert);
        assert!(body.starts_with("Alert: Recovery Escalated\nDetails: 3 attempts failed\nTime: "));
    }

    #[tokio::test]
    async fn webhook_sink_posts_payload() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<serde_json::Value>();
        let router = Router::new().route(
            "/hook",
            post(move |Json(body): Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body);
                    "ok"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let sink = WebhookSink::new(format!("http://{addr}/hook"), Duration::from_secs(2));
        sink.send(&Alert::warning("Recovering", "attempt 1/3")).await.unwrap();

        let body = rx.recv().await.unwrap();
        assert_eq!(body["text"], "🚨 vLLM Alert: Recovering");
        assert_eq!(body["attachments"][0]["color"], "warning");
    }

    #[tokio::test]
    async fn webhook_sink_reports_unreachable_endpoint() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let sink = WebhookSink::new(format!("http://{addr}/hook"), Duration::from_secs(1));
        assert!(sink.send(&Alert::info("t", "m")).await.is_err());
    }
}
