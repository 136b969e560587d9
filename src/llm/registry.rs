//! In-flight LLM request registry.
//!
//! Tracks the active request per run so operators can cancel or transparently
//! retry it. The facade polls the entry's cancel flag every second while a
//! request is in flight.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

/// One registered in-flight request.
#[derive(Debug)]
pub struct RequestEntry {
    /// Unique id of this request
    pub request_id: String,
    /// Run the request belongs to
    pub run_id: String,
    /// Backend name serving the request
    pub provider: String,
    /// Model requested
    pub model: String,
    /// When the request started (unix millis)
    pub started_at: i64,
    cancel: AtomicBool,
    retry: AtomicBool,
    retry_count: AtomicU32,
}

impl RequestEntry {
    /// Whether cancellation has been requested
    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Consume a pending retry request, clearing the cancel flag with it.
    ///
    /// Returns true when a retry was pending; the caller restarts the call.
    pub fn take_retry(&self) -> bool {
        if self.retry.swap(false, Ordering::SeqCst) {
            self.cancel.store(false, Ordering::SeqCst);
            self.retry_count.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Snapshot for operator inspection
    pub fn snapshot(&self) -> Value {
        json!({
            "request_id": self.request_id,
            "run_id": self.run_id,
            "provider": self.provider,
            "model": self.model,
            "started_at": self.started_at,
            "retry_count": self.retry_count.load(Ordering::SeqCst),
            "cancel_requested": self.cancel.load(Ordering::SeqCst),
            "retry_requested": self.retry.load(Ordering::SeqCst),
        })
    }
}

/// Process-wide registry of in-flight LLM requests, one per run.
#[derive(Debug, Default)]
pub struct LlmRequestRegistry {
    entries: Mutex<HashMap<String, Arc<RequestEntry>>>,
}

impl LlmRequestRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the active request for a run, replacing any stale entry
    pub fn register(&self, run_id: &str, provider: &str, model: &str) -> Arc<RequestEntry> {
        let entry = Arc::new(RequestEntry {
            request_id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            started_at: Utc::now().timestamp_millis(),
            cancel: AtomicBool::new(false),
            retry: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
        });
        let mut entries = self.entries.lock().expect("llm registry lock poisoned");
        if let Some(existing) = entries.get(run_id) {
            warn!(
                "Overwriting active LLM request entry for run_id={} old_request_id={}",
                run_id, existing.request_id
            );
        }
        entries.insert(run_id.to_string(), Arc::clone(&entry));
        entry
    }

    /// Get the active request for a run
    pub fn get(&self, run_id: &str) -> Option<Arc<RequestEntry>> {
        let entries = self.entries.lock().expect("llm registry lock poisoned");
        entries.get(run_id).cloned()
    }

    /// Remove an entry once its request has completed
    pub fn clear(&self, run_id: &str, request_id: &str) {
        let mut entries = self.entries.lock().expect("llm registry lock poisoned");
        if let Some(entry) = entries.get(run_id) {
            if entry.request_id == request_id {
                entries.remove(run_id);
            }
        }
    }

    /// Request cancellation of a run's active request
    pub fn request_cancel(&self, run_id: &str) -> Option<Value> {
        let entry = self.get(run_id)?;
        entry.cancel.store(true, Ordering::SeqCst);
        Some(entry.snapshot())
    }

    /// Request cancel-and-retry of a run's active request.
    ///
    /// The facade observes the cancel flag, then consumes the retry flag and
    /// restarts the request transparently.
    pub fn request_cancel_retry(&self, run_id: &str) -> Option<Value> {
        let entry = self.get(run_id)?;
        entry.cancel.store(true, Ordering::SeqCst);
        entry.retry.store(true, Ordering::SeqCst);
        Some(entry.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_clear() {
        let registry = LlmRequestRegistry::new();
        let entry = registry.register("run-1", "primary", "model-a");
        assert!(registry.get("run-1").is_some());

        registry.clear("run-1", &entry.request_id);
        assert!(registry.get("run-1").is_none());
    }

    #[test]
    fn test_clear_ignores_stale_request_id() {
        let registry = LlmRequestRegistry::new();
        let _old = registry.register("run-1", "primary", "model-a");
        let new = registry.register("run-1", "primary", "model-a");

        registry.clear("run-1", "not-the-active-request");
        assert!(registry.get("run-1").is_some());
        registry.clear("run-1", &new.request_id);
        assert!(registry.get("run-1").is_none());
    }

    #[test]
    fn test_cancel_retry_cycle() {
        let registry = LlmRequestRegistry::new();
        let entry = registry.register("run-1", "primary", "model-a");
        assert!(!entry.cancel_requested());

        registry.request_cancel_retry("run-1");
        assert!(entry.cancel_requested());
        assert!(entry.take_retry());
        // Retry consumed: cancel flag cleared, no second retry pending.
        assert!(!entry.cancel_requested());
        assert!(!entry.take_retry());
    }
}
