//! Planner session state.
//!
//! `PlannerState` is the memory of one planning session: execution history,
//! the tool discovery cache, raw outputs, budget counters, and event log.
//! It builds both the planner-state JSON the LLM consumes and the
//! self-contained markdown trajectory the orchestrator's translator consumes.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::catalog::{ProviderTools, ToolDescriptor};
use crate::context::RunContext;
use crate::cost::TokenCostTracker;
use crate::planner::budget::{Budget, BudgetTracker};
use crate::planner::history::{AgentStep, ExecutionHistory, StepRecord};

/// Sandbox failure tracebacks beyond this length are tail-truncated in the
/// markdown trajectory.
const TRACEBACK_TAIL: usize = 4000;
/// Log lines kept per sandbox observation in the markdown trajectory.
const MAX_LOG_LINES: usize = 50;

/// Planning session state: the agent's memory.
pub struct PlannerState {
    /// The delegated task
    pub task: String,
    /// Acting user
    pub user_id: String,
    /// Run id shared with the outer loop
    pub run_id: String,
    /// Derived task id
    pub task_id: String,
    /// Extra metadata visible to prompts and the summarizer
    pub extra_context: Map<String, Value>,
    /// Budget counters
    pub budget_tracker: BudgetTracker,
    /// Cost accounting for this delegation only.
    ///
    /// Fresh per session: the cost cap must not count spending by the outer
    /// loop or earlier delegations. The run-wide tracker accrues separately.
    pub token_tracker: Arc<TokenCostTracker>,
    /// Authorized provider tree (names only)
    pub provider_tree: Vec<ProviderTools>,
    /// Whether inventory has been loaded
    pub discovery_completed: bool,
    /// Event log accumulated during the session
    pub logs: Vec<Value>,
    /// Raw outputs keyed by `tool.<provider>.<name>` or `sandbox.<label>`
    pub raw_outputs: Map<String, Value>,

    history: ExecutionHistory,
    search_results: Vec<ToolDescriptor>,
}

impl PlannerState {
    /// Create state for one planning session
    pub fn new(
        task: &str,
        user_id: &str,
        run_id: &str,
        budget: Budget,
        extra_context: Map<String, Value>,
    ) -> Self {
        PlannerState {
            task: task.trim().to_string(),
            user_id: user_id.to_string(),
            run_id: run_id.to_string(),
            task_id: generate_task_id(user_id, task),
            extra_context,
            budget_tracker: BudgetTracker::new(budget),
            token_tracker: Arc::new(TokenCostTracker::new()),
            provider_tree: Vec::new(),
            discovery_completed: false,
            logs: Vec::new(),
            raw_outputs: Map::new(),
            history: ExecutionHistory::new(),
            search_results: Vec::new(),
        }
    }

    /// Execution history
    pub fn history(&self) -> &[AgentStep] {
        self.history.steps()
    }

    /// Tool discovery cache
    pub fn search_results(&self) -> &[ToolDescriptor] {
        &self.search_results
    }

    /// Whether a tool id is present in the discovery cache
    pub fn is_discovered(&self, tool_id: &str) -> bool {
        self.search_results.iter().any(|d| d.tool_id == tool_id)
    }

    /// Whether any search step has run
    pub fn has_search_steps(&self) -> bool {
        self.history.has_search_steps()
    }

    /// Failed sandbox steps with the given error code and label
    pub fn sandbox_errors_for_label(&self, error_code: &str, label: &str) -> usize {
        self.history.sandbox_errors_for_label(error_code, label)
    }

    /// Record a step in history
    pub fn record_step(&mut self, record: StepRecord) {
        self.history.record(record);
    }

    /// Record an event: appended to the session log and published on the
    /// run's stream and log scope.
    pub fn record_event(&mut self, ctx: &RunContext, event: &str, payload: Value) {
        let mut enriched = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        enriched.insert("task".to_string(), json!(self.task));
        enriched.insert("task_id".to_string(), json!(self.task_id));
        self.logs.push(json!({"event": event, "payload": enriched.clone()}));
        ctx.emit(event, Value::Object(enriched));
    }

    /// Merge new search results, keeping the highest score per tool id.
    pub fn merge_search_results(&mut self, results: &[ToolDescriptor]) {
        for incoming in results {
            match self
                .search_results
                .iter_mut()
                .find(|existing| existing.tool_id == incoming.tool_id)
            {
                Some(existing) => {
                    if incoming.score > existing.score {
                        *existing = incoming.clone();
                    }
                }
                None => self.search_results.push(incoming.clone()),
            }
        }
    }

    /// Append a raw output entry under a key
    pub fn append_raw_output(&mut self, key: &str, entry: Value) {
        match self.raw_outputs.get_mut(key) {
            Some(Value::Array(entries)) => entries.push(entry),
            _ => {
                self.raw_outputs.insert(key.to_string(), json!([entry]));
            }
        }
    }

    /// Fold markers surfaced to the planner so far (inspect validation).
    pub fn seen_fold_paths(&self, tool_id: &str) -> Vec<String> {
        self.search_results
            .iter()
            .filter(|descriptor| descriptor.tool_id == tool_id)
            .flat_map(|descriptor| descriptor.output_fields.iter())
            .filter_map(|field| crate::catalog::fold_marker_path(field))
            .map(str::to_string)
            .collect()
    }

    /// Build the planner-state JSON consumed by the planner LLM.
    ///
    /// `available_tools` is the single source of truth for tool specs;
    /// trajectory entries carry only summaries.
    pub fn build_planner_state(&self) -> Value {
        json!({
            "task": self.task,
            "user_id": self.user_id,
            "run_id": self.run_id,
            "provider_tree": self.provider_tree,
            "available_tools": self.search_results,
            "trajectory": self.history.build_trajectory(),
        })
    }

    /// Build the complete, self-contained markdown trajectory for the
    /// orchestrator. Everything the translator needs is in this document;
    /// no raw outputs travel with it.
    pub fn build_markdown_trajectory(&self) -> String {
        let mut lines: Vec<String> = Vec::new();

        for step in self.history.steps() {
            let step_num = step.index + 1;
            match step.kind.as_str() {
                "search" => {
                    let query = step
                        .command
                        .get("query")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let provider = step
                        .command
                        .get("provider")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let found = step
                        .output
                        .get("found_tools")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or_default();

                    lines.push(format!("### Step {}: Search - {}", step_num, provider));
                    lines.push(format!("**Query**: {}", query));
                    lines.push(format!("**Found**: {} tool(s)", found.len()));
                    if !found.is_empty() {
                        lines.push("**Tools**:".to_string());
                        for tool in found.iter().take(20) {
                            let tool_id =
                                tool.get("tool_id").and_then(Value::as_str).unwrap_or("unknown");
                            let description = tool
                                .get("description")
                                .and_then(Value::as_str)
                                .unwrap_or("");
                            let description: String = description.chars().take(150).collect();
                            lines.push(format!("- `{}`: {}", tool_id, description));
                        }
                    }
                    if !step.success {
                        if let Some(ref error) = step.error {
                            lines.push(format!("**Error**: {}", error));
                        }
                    }
                }
                "tool" => {
                    let tool_id = step
                        .command
                        .get("tool_id")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    let args = step.command.get("args").cloned().unwrap_or(json!({}));

                    lines.push(format!("### Step {}: Tool Call - {}", step_num, tool_id));
                    lines.push(format!(
                        "**Arguments**:\n```json\n{}\n```",
                        pretty(&args)
                    ));
                    if step.success {
                        lines.push(format!(
                            "**Response**:\n```json\n{}\n```",
                            pretty(&step.output)
                        ));
                        if step.is_smart_summary {
                            lines.push("*(Response summarized via LLM)*".to_string());
                        }
                    } else {
                        lines.push(format!(
                            "**Error**: {}",
                            step.error.as_deref().unwrap_or("Unknown error")
                        ));
                    }
                }
                "inspect_tool_output" => {
                    let tool_id = step
                        .command
                        .get("tool_id")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    let field_path = step
                        .command
                        .get("field_path")
                        .and_then(Value::as_str)
                        .unwrap_or("");

                    lines.push(format!(
                        "### Step {}: Inspect Tool Output - {}",
                        step_num, tool_id
                    ));
                    lines.push(format!(
                        "**Field Path**: {}",
                        if field_path.is_empty() { "(root)" } else { field_path }
                    ));
                    if step.success {
                        lines.push(format!(
                            "**Observation**:\n```json\n{}\n```",
                            pretty(&step.output)
                        ));
                    } else {
                        lines.push(format!(
                            "**Error**: {}",
                            step.error.as_deref().unwrap_or("Unknown error")
                        ));
                    }
                }
                "sandbox" => {
                    let code = step
                        .command
                        .get("code")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    lines.push(format!("### Step {}: Sandbox Execution", step_num));
                    lines.push(format!("**Code**:\n```python\n{}\n```", code));
                    if step.success {
                        lines.push(format!(
                            "**Output**:\n```json\n{}\n```",
                            pretty(&step.output)
                        ));
                        if step.is_smart_summary {
                            lines.push("*(Output summarized via LLM)*".to_string());
                        }
                    } else {
                        lines.push(format!(
                            "**Error**: {}",
                            step.error.as_deref().unwrap_or("Unknown error")
                        ));
                        // Include the failure observation so the translator
                        // sees the underlying error, logs, and traceback.
                        let observation = trim_sandbox_failure(&step.output);
                        lines.push(format!(
                            "**Observation**:\n```json\n{}\n```",
                            pretty(&observation)
                        ));
                    }
                }
                "finish" | "fail" => {
                    let summary = step
                        .output
                        .get("summary")
                        .or_else(|| step.output.get("error"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let reasoning = step
                        .command
                        .get("reasoning")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let label = if step.kind == "finish" { "Completion" } else { "Failure" };
                    lines.push(format!("### Step {}: {}", step_num, label));
                    lines.push(format!("**Reasoning**: {}", reasoning));
                    lines.push(format!("**Summary**: {}", summary));
                    if !step.success || step.error.is_some() {
                        lines.push(format!(
                            "**Error**: {}",
                            step.error.as_deref().unwrap_or("Task failed")
                        ));
                    }
                }
                _ => {}
            }
            lines.push(String::new());
        }

        lines.join("\n")
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Trim oversized tracebacks and log arrays in sandbox failure observations.
fn trim_sandbox_failure(observation: &Value) -> Value {
    let Value::Object(map) = observation else {
        return observation.clone();
    };
    let mut out = map.clone();
    if let Some(Value::String(traceback)) = out.get("traceback") {
        if traceback.len() > TRACEBACK_TAIL {
            let tail_start = traceback.len() - TRACEBACK_TAIL;
            let mut start = tail_start;
            while !traceback.is_char_boundary(start) {
                start += 1;
            }
            out.insert(
                "traceback".to_string(),
                json!(format!("... (truncated) ...\n{}", &traceback[start..])),
            );
        }
    }
    if let Some(Value::Array(logs)) = out.get("logs") {
        if logs.len() > MAX_LOG_LINES {
            let mut kept: Vec<Value> = logs[..MAX_LOG_LINES].to_vec();
            kept.push(json!("... (truncated)"));
            out.insert("logs".to_string(), Value::Array(kept));
        }
    }
    Value::Object(out)
}

fn generate_task_id(user_id: &str, task: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", user_id, task).as_bytes());
    let hex: String = digest.iter().take(5).map(|b| format!("{:02x}", b)).collect();
    let base: String = user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect();
    let base = base.trim_matches('-');
    let base = if base.is_empty() { "task" } else { base };
    format!("{}-{}", base, hex)
}
