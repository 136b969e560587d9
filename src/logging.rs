//! Hierarchical per-run logging.
//!
//! Each run owns a directory `<logs>/<timestamp>-<task-hash>/` containing a
//! `metadata.json` plus one JSONL event stream per agent scope:
//!
//! ```text
//! <logs>/<run-timestamp>-<task-hash>/
//!   metadata.json
//!   orchestrator/main.jsonl
//!   orchestrator/planner/main.jsonl
//!   orchestrator/translator/main.jsonl
//! ```
//!
//! Files are per-run, so events from different runs never interleave within
//! one stream. String payloads longer than 500 characters are truncated in
//! the log record only; the observation pipeline keeps full payloads.

use chrono::Utc;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

const MAX_LOGGED_STRING: usize = 500;

/// Root logger for one run.
#[derive(Debug)]
pub struct RunLogger {
    root: PathBuf,
    streams: Mutex<HashMap<String, Arc<Mutex<File>>>>,
}

/// Handle bound to one agent scope (e.g. `orchestrator/planner`).
#[derive(Debug, Clone)]
pub struct AgentLogger {
    scope: String,
    file: Arc<Mutex<File>>,
}

fn task_hash(task: &str) -> String {
    let digest = Sha256::digest(task.as_bytes());
    hex_prefix(&digest, 10)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

impl RunLogger {
    /// Create the run directory and write `metadata.json`
    pub fn create(logs_root: &Path, task: &str) -> std::io::Result<Arc<Self>> {
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let hash = task_hash(task);
        let root = logs_root.join(format!("{}-{}", timestamp, hash));
        std::fs::create_dir_all(&root)?;

        let metadata = json!({
            "task": task,
            "task_hash": hash,
            "timestamp": Utc::now().to_rfc3339(),
        });
        std::fs::write(
            root.join("metadata.json"),
            serde_json::to_vec_pretty(&metadata).unwrap_or_default(),
        )?;

        Ok(Arc::new(RunLogger {
            root,
            streams: Mutex::new(HashMap::new()),
        }))
    }

    /// Directory owned by this run
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get (or open) the JSONL stream for an agent scope
    pub fn agent(&self, scope: &str) -> AgentLogger {
        let mut streams = self.streams.lock().expect("run logger lock poisoned");
        let file = streams.entry(scope.to_string()).or_insert_with(|| {
            let dir = self.root.join(scope);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                warn!("Failed to create log dir {}: {}", dir.display(), e);
            }
            let path = dir.join("main.jsonl");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .unwrap_or_else(|e| {
                    warn!("Failed to open log stream {}: {}", path.display(), e);
                    // Fall back to a discard sink so logging never aborts a run.
                    OpenOptions::new()
                        .write(true)
                        .open("/dev/null")
                        .expect("open /dev/null")
                });
            Arc::new(Mutex::new(file))
        });
        AgentLogger {
            scope: scope.to_string(),
            file: Arc::clone(file),
        }
    }
}

impl AgentLogger {
    /// Scope path of this stream
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Append one event record to the stream
    pub fn log_event(&self, event: &str, payload: Value) {
        let record = json!({
            "ts": Utc::now().to_rfc3339(),
            "event": event,
            "payload": truncate_payload(payload),
        });
        let mut file = self.file.lock().expect("agent logger lock poisoned");
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Truncate long string values in-place for the log record.
fn truncate_payload(payload: Value) -> Value {
    match payload {
        Value::String(s) if s.len() > MAX_LOGGED_STRING => {
            let mut cut = MAX_LOGGED_STRING;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            Value::String(format!("{}... (+{} chars truncated)", &s[..cut], s.len() - cut))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key, truncate_payload(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(truncate_payload).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_run_logger_layout() {
        let dir = tempdir().unwrap();
        let logger = RunLogger::create(dir.path(), "test task").unwrap();

        logger
            .agent("orchestrator")
            .log_event("task.started", json!({"task": "test task"}));
        logger
            .agent("orchestrator/planner")
            .log_event("mcp.planner.started", json!({"budget": {}}));

        assert!(logger.root().join("metadata.json").exists());
        assert!(logger.root().join("orchestrator/main.jsonl").exists());
        assert!(logger.root().join("orchestrator/planner/main.jsonl").exists());

        let contents =
            std::fs::read_to_string(logger.root().join("orchestrator/main.jsonl")).unwrap();
        assert!(contents.contains("task.started"));
    }

    #[test]
    fn test_truncate_payload_long_string() {
        let long = "x".repeat(600);
        let truncated = truncate_payload(json!({"blob": long}));
        let rendered = truncated["blob"].as_str().unwrap();
        assert!(rendered.len() < 600);
        assert!(rendered.contains("truncated"));
    }

    #[test]
    fn test_truncate_payload_leaves_short_values() {
        let payload = json!({"count": 3, "name": "short"});
        assert_eq!(truncate_payload(payload.clone()), payload);
    }
}
