//! Execution history for the planner loop.
//!
//! Stores the step-by-step record of a planning session and builds the lossy
//! trajectory the LLM sees. Full observations live on the steps; the
//! trajectory carries summaries to keep context small.

use serde::Serialize;
use serde_json::{json, Value};

/// Maximum preview length stored on a step
const PREVIEW_LIMIT: usize = 200;

/// Single step in agent execution history.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStep {
    /// Position in history, contiguous from 0
    pub index: usize,
    /// Step kind (search, tool, sandbox, inspect_tool_output, finish, fail)
    #[serde(rename = "type")]
    pub kind: String,
    /// The validated command that produced this step
    pub command: Value,
    /// Whether the step succeeded
    pub success: bool,
    /// Short preview text (≤ 200 chars)
    pub preview: String,
    /// Key into the raw-output store, when applicable
    pub result_key: Option<String>,
    /// Error code or message when failed
    pub error: Option<String>,
    /// Observation recorded for this step (post-summarization)
    pub output: Value,
    /// Whether the observation passed through the LLM summarizer
    pub is_smart_summary: bool,
    /// Token count before summarization
    pub original_tokens: u64,
    /// Token count after summarization
    pub compressed_tokens: u64,
}

impl AgentStep {
    /// Serialize for terminal results
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Arguments for recording one step.
#[derive(Debug)]
pub struct StepRecord {
    pub kind: String,
    pub command: Value,
    pub success: bool,
    pub preview: String,
    pub result_key: Option<String>,
    pub error: Option<String>,
    pub output: Value,
    pub is_smart_summary: bool,
    pub original_tokens: u64,
    pub compressed_tokens: u64,
}

/// Ordered store of executed steps.
#[derive(Debug, Default)]
pub struct ExecutionHistory {
    steps: Vec<AgentStep>,
}

impl ExecutionHistory {
    /// Create an empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only view of all steps
    pub fn steps(&self) -> &[AgentStep] {
        &self.steps
    }

    /// Number of recorded steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the history is empty
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append a step; indices are assigned contiguously from 0.
    pub fn record(&mut self, record: StepRecord) -> &AgentStep {
        let mut preview = record.preview;
        if preview.chars().count() > PREVIEW_LIMIT {
            preview = preview.chars().take(PREVIEW_LIMIT).collect();
        }
        let step = AgentStep {
            index: self.steps.len(),
            kind: record.kind,
            command: record.command,
            success: record.success,
            preview,
            result_key: record.result_key,
            error: record.error,
            output: record.output,
            is_smart_summary: record.is_smart_summary,
            original_tokens: record.original_tokens,
            compressed_tokens: record.compressed_tokens,
        };
        self.steps.push(step);
        self.steps.last().expect("just pushed")
    }

    /// Count failed sandbox steps with the given error code and label.
    pub fn sandbox_errors_for_label(&self, error_code: &str, label: &str) -> usize {
        self.steps
            .iter()
            .filter(|step| {
                step.kind == "sandbox"
                    && step.error.as_deref() == Some(error_code)
                    && step
                        .command
                        .get("label")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        == Some(label)
            })
            .count()
    }

    /// Whether any search step has been recorded
    pub fn has_search_steps(&self) -> bool {
        self.steps.iter().any(|step| step.kind == "search")
    }

    /// Build the trajectory sent to the LLM: one summary entry per step.
    pub fn build_trajectory(&self) -> Vec<Value> {
        self.steps
            .iter()
            .map(|step| {
                let mut entry = json!({
                    "step": step.index,
                    "type": step.kind,
                    "reasoning": step.command.get("reasoning").and_then(Value::as_str).unwrap_or(""),
                    "status": if step.success { "success" } else { "failed" },
                });
                let summary = match step.kind.as_str() {
                    "search" => json!(summarize_search_observation(&step.output)),
                    "tool" => {
                        entry["tool_id"] = step
                            .command
                            .get("tool_id")
                            .cloned()
                            .unwrap_or_else(|| json!("unknown"));
                        step.output.clone()
                    }
                    "sandbox" | "inspect_tool_output" => step.output.clone(),
                    _ => {
                        if step.preview.is_empty() {
                            json!("Step completed")
                        } else {
                            json!(step.preview)
                        }
                    }
                };
                entry["summary"] = summary;
                entry
            })
            .collect()
    }

    /// Serialize all steps for terminal results
    pub fn to_values(&self) -> Vec<Value> {
        self.steps.iter().map(AgentStep::to_value).collect()
    }
}

/// Summarize a search observation to tool ids only; full specs live in the
/// planner state's `available_tools`.
fn summarize_search_observation(observation: &Value) -> String {
    let found = observation
        .get("found_tools")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    if found.is_empty() {
        return "Search returned no results".to_string();
    }
    let tool_ids: Vec<&str> = found
        .iter()
        .map(|tool| tool.get("tool_id").and_then(Value::as_str).unwrap_or("unknown"))
        .collect();
    if tool_ids.len() <= 3 {
        format!("Found {} tools: {}", tool_ids.len(), tool_ids.join(", "))
    } else {
        format!(
            "Found {} tools: {}, ...",
            tool_ids.len(),
            tool_ids[..3].join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: &str, success: bool, error: Option<&str>, command: Value) -> StepRecord {
        StepRecord {
            kind: kind.to_string(),
            command,
            success,
            preview: "preview".to_string(),
            result_key: None,
            error: error.map(str::to_string),
            output: json!({}),
            is_smart_summary: false,
            original_tokens: 0,
            compressed_tokens: 0,
        }
    }

    #[test]
    fn test_indices_contiguous() {
        let mut history = ExecutionHistory::new();
        history.record(record("search", true, None, json!({})));
        history.record(record("tool", true, None, json!({})));
        history.record(record("finish", true, None, json!({})));
        let indices: Vec<usize> = history.steps().iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_preview_truncated() {
        let mut history = ExecutionHistory::new();
        let long = "x".repeat(500);
        let step = history.record(StepRecord {
            preview: long,
            ..record("tool", true, None, json!({}))
        });
        assert_eq!(step.preview.chars().count(), 200);
    }

    #[test]
    fn test_sandbox_errors_for_label() {
        let mut history = ExecutionHistory::new();
        history.record(record(
            "sandbox",
            false,
            Some("sandbox_syntax_error"),
            json!({"label": "calc"}),
        ));
        history.record(record(
            "sandbox",
            false,
            Some("sandbox_syntax_error"),
            json!({"label": "other"}),
        ));
        history.record(record(
            "sandbox",
            false,
            Some("sandbox_runtime_error"),
            json!({"label": "calc"}),
        ));
        assert_eq!(history.sandbox_errors_for_label("sandbox_syntax_error", "calc"), 1);
        assert_eq!(history.sandbox_errors_for_label("sandbox_syntax_error", "other"), 1);
    }

    #[test]
    fn test_trajectory_search_summary() {
        let mut history = ExecutionHistory::new();
        history.record(StepRecord {
            output: json!({"found_tools": [
                {"tool_id": "gmail.a"}, {"tool_id": "gmail.b"},
                {"tool_id": "gmail.c"}, {"tool_id": "gmail.d"},
            ], "count": 4}),
            ..record(
                "search",
                true,
                None,
                json!({"reasoning": "find tools", "query": "gmail"}),
            )
        });
        let trajectory = history.build_trajectory();
        assert_eq!(trajectory.len(), 1);
        let summary = trajectory[0]["summary"].as_str().unwrap();
        assert!(summary.starts_with("Found 4 tools: gmail.a, gmail.b, gmail.c, ..."));
        assert_eq!(trajectory[0]["reasoning"], "find tools");
    }

    #[test]
    fn test_trajectory_tool_entry_carries_tool_id() {
        let mut history = ExecutionHistory::new();
        history.record(StepRecord {
            output: json!({"messages": []}),
            ..record(
                "tool",
                true,
                None,
                json!({"reasoning": "call", "tool_id": "gmail.gmail_search"}),
            )
        });
        let trajectory = history.build_trajectory();
        assert_eq!(trajectory[0]["tool_id"], "gmail.gmail_search");
        assert_eq!(trajectory[0]["summary"], json!({"messages": []}));
    }
}
