//! Per-run event streaming.
//!
//! The `StreamBus` fans structured events out to SSE-style subscribers. Each
//! run gets its own broadcast channel so events from different runs never
//! interleave on a subscriber. Payloads are redacted before publication.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Keys whose values are replaced before an event leaves the core.
const REDACT_KEYS: &[&str] = &["token", "authorization", "password", "api_key", "secret"];

/// A structured event published on a run's stream.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Event name, e.g. `mcp.planner.started`
    pub event: String,
    /// Run the event belongs to
    pub run_id: String,
    /// Redacted payload
    pub payload: Value,
}

/// Per-run pub/sub for structured events.
#[derive(Debug, Default)]
pub struct StreamBus {
    channels: Mutex<HashMap<String, broadcast::Sender<StreamEvent>>>,
}

impl StreamBus {
    /// Create a new, empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a run's event stream
    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<StreamEvent> {
        let mut channels = self.channels.lock().expect("stream bus lock poisoned");
        channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event on a run's stream.
    ///
    /// Events are dropped silently when the run has no subscribers.
    pub fn publish(&self, run_id: &str, event: &str, payload: Value) {
        let sender = {
            let channels = self.channels.lock().expect("stream bus lock poisoned");
            channels.get(run_id).cloned()
        };
        if let Some(sender) = sender {
            let _ = sender.send(StreamEvent {
                event: event.to_string(),
                run_id: run_id.to_string(),
                payload: redact_payload(payload),
            });
        }
    }

    /// Drop a run's channel once the run is terminal
    pub fn close(&self, run_id: &str) {
        let mut channels = self.channels.lock().expect("stream bus lock poisoned");
        channels.remove(run_id);
    }
}

/// Replace sensitive values in a payload before it leaves the core.
pub fn redact_payload(payload: Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut redacted = Map::with_capacity(map.len());
            for (key, value) in map {
                let lower = key.to_lowercase();
                if REDACT_KEYS.iter().any(|k| lower.contains(k)) {
                    redacted.insert(key, json!("<redacted>"));
                } else {
                    redacted.insert(key, redact_payload(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(redact_payload).collect()),
        other => other,
    }
}
