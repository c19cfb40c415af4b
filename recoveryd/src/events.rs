//! Broadcast of controller events as JSON lines.
//!
//! Transitions, strategy runs, rollbacks and alerts are published here so
//! in-process observers (the HTTP surface, tests) can follow the loop
//! without touching controller state.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl EventBus {
    /// Create a bus. The buffer never drops below `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(DEFAULT_BUFFER));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Publish `{event, data, timestamp}`. Having no subscribers is fine.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("Failed to serialize event {}: {}", event, err),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recovery_common::{ErrorKind, Phase};
    use std::time::Duration;

    #[tokio::test]
    async fn emit_wraps_payload_with_timestamp() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(
            "transition",
            &json!({ "from": Phase::Healthy, "to": Phase::Degraded, "kind": ErrorKind::DiskFull }),
        );

        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("broadcast recv failed");
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["event"], "transition");
        assert_eq!(parsed["data"]["to"], "degraded");
        assert_eq!(parsed["data"]["kind"], "disk_full");
        let ts = parsed["timestamp"].as_str().unwrap();
        chrono::DateTime::parse_from_rfc3339(ts).unwrap();
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        EventBus::new(1).emit("alert", &json!({ "title": "nobody listening" }));
    }

    #[tokio::test]
    async fn small_buffers_are_raised_to_default() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();
        for idx in 0..DEFAULT_BUFFER {
            bus.emit("tick", &idx);
        }
        let first: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["data"], 0);
    }

    #[derive(Serialize)]
    struct NonFinite {
        value: f64,
    }

    #[tokio::test]
    async fn unserializable_payload_is_dropped() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit("bad", &NonFinite { value: f64::NAN });
        let result = tokio::time::timeout(Duration::from_millis(25), rx.recv()).await;
        assert!(result.is_err());
    }
}
