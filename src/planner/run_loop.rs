//! The planner loop.
//!
//! Drives one delegated task to a terminal result: load inventory, ask the
//! LLM for the next command, validate, execute, record, repeat. Terminal
//! states are finish, fail, budget exhaustion, and protocol errors.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

use crate::catalog::ToolIndex;
use crate::config::SandboxConfig;
use crate::context::RunContext;
use crate::dispatch::ToolDispatcher;
use crate::error::{Error, Result};
use crate::llm::LlmClient;
use crate::orchestrator::types::ToolConstraints;
use crate::planner::budget::Budget;
use crate::planner::command::{parse_planner_command, PlannerCommand};
use crate::planner::executor::{ActionExecutor, ActionOutcome};
use crate::planner::history::StepRecord;
use crate::planner::llm::PlannerLlm;
use crate::planner::state::PlannerState;
use crate::sandbox::{SandboxRunner, Toolbox};

/// Syntax errors per sandbox label tolerated before escalation.
const SANDBOX_SYNTAX_ERROR_LIMIT: usize = 2;

/// Terminal result of one planner task.
#[derive(Debug, Clone)]
pub struct McpTaskResult {
    pub success: bool,
    pub final_summary: String,
    pub user_id: String,
    pub run_id: String,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
    pub raw_outputs: Map<String, Value>,
    pub budget_usage: Value,
    pub logs: Vec<Value>,
    pub steps: Vec<Value>,
    /// Self-contained markdown trajectory for the orchestrator
    pub trajectory_md: String,
}

impl McpTaskResult {
    /// Serialize for logging and bridge transport
    pub fn to_value(&self) -> Value {
        json!({
            "success": self.success,
            "final_summary": self.final_summary,
            "user_id": self.user_id,
            "run_id": self.run_id,
            "error": self.error,
            "error_code": self.error_code,
            "error_message": self.error_message,
            "error_details": self.error_details,
            "raw_outputs": self.raw_outputs,
            "budget_usage": self.budget_usage,
            "steps": self.steps,
        })
    }
}

/// Dependencies a planner run needs from its host.
pub struct PlannerDeps<'a> {
    pub llm: &'a LlmClient,
    pub index: &'a ToolIndex,
    pub dispatcher: Arc<dyn ToolDispatcher>,
    pub sandbox_config: &'a SandboxConfig,
    pub tool_constraints: Option<&'a ToolConstraints>,
}

/// Execute a standalone planner task and return a structured result.
pub async fn execute_mcp_task(
    ctx: &RunContext,
    deps: PlannerDeps<'_>,
    task: &str,
    budget: Budget,
    extra_context: Map<String, Value>,
) -> Result<McpTaskResult> {
    if task.trim().is_empty() {
        return Err(Error::InvalidInput("task must be a non-empty string.".into()));
    }

    let toolbox = Toolbox::generate(deps.index, &ctx.user_id)?;
    // A missing interpreter only matters if the planner actually asks for a
    // sandbox step.
    let sandbox_runner = SandboxRunner::new(deps.sandbox_config, Arc::clone(&deps.dispatcher)).ok();

    let mut state = PlannerState::new(task, &ctx.user_id, &ctx.run_id, budget, extra_context);
    // Scope LLM accounting to this delegation: the session's own tracker
    // feeds the planner cost cap while the run-wide tracker keeps accruing
    // for step usage reporting.
    let ctx = &ctx.with_delegation_cost(Arc::clone(&state.token_tracker));
    state.record_event(
        ctx,
        "mcp.planner.started",
        json!({
            "budget": state.budget_tracker.snapshot().to_value(),
            "extra_context_keys": state.extra_context.keys().collect::<Vec<_>>(),
            "ephemeral_toolbox": toolbox.python_path().display().to_string(),
        }),
    );

    // Load inventory: high-level provider tree only.
    state.provider_tree = deps.index.inventory(deps.tool_constraints);
    state.discovery_completed = true;

    let planner_llm = PlannerLlm::new(deps.llm);
    let executor = ActionExecutor::new(
        deps.index,
        Arc::clone(&deps.dispatcher),
        sandbox_runner.as_ref(),
        &toolbox,
        deps.llm,
    );

    loop {
        ctx.signals.raise_if_exit_requested()?;
        ctx.signals.wait_for_resume().await?;

        // Budget gate runs before any LLM call so a zero budget never spends.
        if let Some(budget_type) = state.budget_tracker.snapshot().first_exhausted() {
            return Ok(budget_failure(ctx, &mut state, budget_type));
        }
        state.budget_tracker.steps_taken += 1;

        let command = match next_command(ctx, &planner_llm, &mut state).await? {
            Ok(command) => command,
            Err(parse_error) => {
                return Ok(terminal_failure(
                    ctx,
                    &mut state,
                    "planner_parse_error",
                    &parse_error,
                    None,
                    false,
                ));
            }
        };

        match &command {
            PlannerCommand::Finish { summary, .. } => {
                let summary = summary.clone();
                let reasoning = command.reasoning().to_string();
                state.record_step(StepRecord {
                    kind: "finish".into(),
                    command: command.to_value(),
                    success: true,
                    preview: if reasoning.is_empty() { summary.clone() } else { reasoning },
                    result_key: None,
                    error: None,
                    output: json!({"summary": summary}),
                    is_smart_summary: false,
                    original_tokens: 0,
                    compressed_tokens: 0,
                });
                return Ok(success_result(&state, &summary));
            }
            PlannerCommand::Fail { reason, .. } => {
                let reason = reason.clone();
                state.record_step(StepRecord {
                    kind: "fail".into(),
                    command: command.to_value(),
                    success: false,
                    preview: reason.clone(),
                    result_key: None,
                    error: Some(reason.clone()),
                    output: json!({"error": reason}),
                    is_smart_summary: false,
                    original_tokens: 0,
                    compressed_tokens: 0,
                });
                return Ok(terminal_failure(
                    ctx,
                    &mut state,
                    "planner_fail_action",
                    &reason,
                    None,
                    true,
                ));
            }
            _ => {}
        }

        let outcome = executor.execute(ctx, &mut state, &command).await?;
        if let Some(result) = apply_outcome(ctx, &mut state, &command, outcome) {
            return Ok(result);
        }
    }
}

/// Ask for the next command, retrying once on empty or unparsable output.
async fn next_command(
    ctx: &RunContext,
    llm: &PlannerLlm<'_>,
    state: &mut PlannerState,
) -> Result<std::result::Result<PlannerCommand, String>> {
    let mut last_error = String::new();
    for attempt in 0..2 {
        let text = llm.next_command_text(ctx, state).await?;
        if text.trim().is_empty() {
            last_error = "Planner response was empty.".to_string();
            state.record_event(ctx, "mcp.llm.retry_empty", json!({"attempt": attempt}));
            continue;
        }
        match parse_planner_command(&text) {
            Ok(command) => return Ok(Ok(command)),
            Err(e) => {
                last_error = e.to_string();
                state.record_event(
                    ctx,
                    "mcp.planner.protocol_error",
                    json!({
                        "error": last_error,
                        "raw_preview": text.chars().take(200).collect::<String>(),
                        "attempt": attempt,
                    }),
                );
            }
        }
    }
    Ok(Err(last_error))
}

/// Record an executed outcome; returns a terminal result when the loop must stop.
fn apply_outcome(
    ctx: &RunContext,
    state: &mut PlannerState,
    command: &PlannerCommand,
    outcome: ActionOutcome,
) -> Option<McpTaskResult> {
    let error_message = outcome
        .observation
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| outcome.preview.clone());

    state.record_step(StepRecord {
        kind: outcome.kind.to_string(),
        command: command.to_value(),
        success: outcome.success,
        preview: outcome.preview.clone(),
        result_key: outcome.raw_output_key.clone(),
        error: outcome
            .error_code
            .clone()
            .or_else(|| outcome.error.clone()),
        output: outcome.observation.clone(),
        is_smart_summary: outcome.is_smart_summary,
        original_tokens: outcome.original_tokens,
        compressed_tokens: outcome.compressed_tokens,
    });

    if outcome.success {
        return None;
    }

    let error_code = outcome
        .error_code
        .clone()
        .unwrap_or_else(|| default_error_code(outcome.kind).to_string());

    // Recoverable sandbox failures keep the loop alive.
    if outcome.kind == "sandbox" {
        if error_code == "sandbox_invalid_body" {
            return None;
        }
        if error_code == "sandbox_syntax_error" {
            let prior_errors = outcome
                .observation
                .get("prior_errors")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            if prior_errors < SANDBOX_SYNTAX_ERROR_LIMIT {
                return None;
            }
        }
    }
    Some(terminal_failure(
        ctx,
        state,
        &error_code,
        &error_message,
        None,
        true,
    ))
}

fn default_error_code(kind: &str) -> &'static str {
    match kind {
        "search" => "search_failed",
        "tool" => "tool_execution_failed",
        "sandbox" => "sandbox_runtime_error",
        _ => "planner_step_failed",
    }
}

fn budget_failure(
    ctx: &RunContext,
    state: &mut PlannerState,
    budget_type: &str,
) -> McpTaskResult {
    let snapshot = state.budget_tracker.snapshot();
    let message = format!("Budget exceeded: {}", budget_type);
    state.record_event(
        ctx,
        "mcp.budget.exceeded",
        json!({
            "budget_type": budget_type,
            "cost": snapshot.estimated_llm_cost_usd,
            "steps_taken": snapshot.steps_taken,
        }),
    );
    state.record_step(StepRecord {
        kind: "finish".into(),
        command: json!({"type": "finish", "summary": message}),
        success: false,
        preview: message.clone(),
        result_key: None,
        error: Some(budget_type.to_string()),
        output: json!({"summary": message}),
        is_smart_summary: false,
        original_tokens: 0,
        compressed_tokens: 0,
    });
    let details = json!({
        "budget_type": budget_type,
        "snapshot": snapshot.to_value(),
    });
    terminal_failure(ctx, state, "budget_exceeded", &message, Some(details), true)
}

fn success_result(state: &PlannerState, summary: &str) -> McpTaskResult {
    let snapshot = state.budget_tracker.snapshot();
    info!("Planner finished: {}", summary);
    McpTaskResult {
        success: true,
        final_summary: summary.to_string(),
        user_id: state.user_id.clone(),
        run_id: state.run_id.clone(),
        error: None,
        error_code: None,
        error_message: None,
        error_details: None,
        raw_outputs: state.raw_outputs.clone(),
        budget_usage: snapshot.to_value(),
        logs: state.logs.clone(),
        steps: state
            .history()
            .iter()
            .map(|step| step.to_value())
            .collect(),
        trajectory_md: state.build_markdown_trajectory(),
    }
}

fn terminal_failure(
    ctx: &RunContext,
    state: &mut PlannerState,
    reason: &str,
    summary: &str,
    details: Option<Value>,
    recorded_step: bool,
) -> McpTaskResult {
    state.record_event(
        ctx,
        "mcp.planner.failed",
        json!({
            "reason": reason,
            "llm_preview": summary.chars().take(200).collect::<String>(),
        }),
    );
    if !recorded_step {
        state.record_step(StepRecord {
            kind: "finish".into(),
            command: json!({"type": "finish", "summary": summary}),
            success: false,
            preview: summary.to_string(),
            result_key: None,
            error: Some(reason.to_string()),
            output: json!({"summary": summary}),
            is_smart_summary: false,
            original_tokens: 0,
            compressed_tokens: 0,
        });
    }
    let snapshot = state.budget_tracker.snapshot();
    McpTaskResult {
        success: false,
        final_summary: summary.to_string(),
        user_id: state.user_id.clone(),
        run_id: state.run_id.clone(),
        error: Some(reason.to_string()),
        error_code: Some(reason.to_string()),
        error_message: Some(summary.to_string()),
        error_details: details,
        raw_outputs: state.raw_outputs.clone(),
        budget_usage: snapshot.to_value(),
        logs: state.logs.clone(),
        steps: state
            .history()
            .iter()
            .map(|step| step.to_value())
            .collect(),
        trajectory_md: state.build_markdown_trajectory(),
    }
}
