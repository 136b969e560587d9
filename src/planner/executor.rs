//! Action execution for the planner loop.
//!
//! Routes validated planner commands to their handlers and returns structured
//! outcomes. Domain failures (unknown tools, sandbox errors, unsuccessful
//! envelopes) come back as failed outcomes; only cancellation propagates as
//! an error.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::catalog::{search_tools, ToolIndex};
use crate::context::RunContext;
use crate::dispatch::{is_envelope, unwrap_nested_data, ToolDispatcher};
use crate::error::Result;
use crate::llm::LlmClient;
use crate::planner::command::PlannerCommand;
use crate::planner::observation::{
    process_sandbox_observation, process_tool_observation, ObservationContext,
};
use crate::planner::state::PlannerState;
use crate::sandbox::{analyze_sandbox, find_forbidden_wrapper, SandboxRunner, Toolbox};

/// Log lines kept in sandbox observations (success and failure paths).
const MAX_OBSERVATION_LOG_LINES: usize = 50;

/// Structured outcome of one executed command.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    /// Step kind
    pub kind: &'static str,
    /// Whether the action succeeded
    pub success: bool,
    /// Observation recorded on the step
    pub observation: Value,
    /// Short preview text
    pub preview: String,
    /// Raw-output store key, when output was stored
    pub raw_output_key: Option<String>,
    /// Error message
    pub error: Option<String>,
    /// Canonical error code
    pub error_code: Option<String>,
    /// Whether the observation was LLM-summarized
    pub is_smart_summary: bool,
    /// Token count before summarization
    pub original_tokens: u64,
    /// Token count after summarization
    pub compressed_tokens: u64,
    /// Tool identity for tool steps
    pub tool_id: Option<String>,
    /// Provider for tool steps
    pub provider: Option<String>,
    /// Tool name for tool steps
    pub tool_name: Option<String>,
    /// Arguments passed to the tool
    pub args: Option<Value>,
}

impl ActionOutcome {
    fn success(kind: &'static str, observation: Value, preview: impl Into<String>) -> Self {
        ActionOutcome {
            kind,
            success: true,
            observation,
            preview: preview.into(),
            raw_output_key: None,
            error: None,
            error_code: None,
            is_smart_summary: false,
            original_tokens: 0,
            compressed_tokens: 0,
            tool_id: None,
            provider: None,
            tool_name: None,
            args: None,
        }
    }

    fn failure(kind: &'static str, code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        ActionOutcome {
            kind,
            success: false,
            observation: json!({"error": message}),
            preview: message.clone(),
            raw_output_key: None,
            error: Some(message),
            error_code: Some(code.to_string()),
            is_smart_summary: false,
            original_tokens: 0,
            compressed_tokens: 0,
            tool_id: None,
            provider: None,
            tool_name: None,
            args: None,
        }
    }
}

/// Routes planner commands to handlers.
pub struct ActionExecutor<'a> {
    index: &'a ToolIndex,
    dispatcher: Arc<dyn ToolDispatcher>,
    /// None when no interpreter is available; sandbox commands then fail soft
    sandbox: Option<&'a SandboxRunner>,
    toolbox: &'a Toolbox,
    llm: &'a LlmClient,
}

impl<'a> ActionExecutor<'a> {
    /// Create an executor over the run's shared pieces
    pub fn new(
        index: &'a ToolIndex,
        dispatcher: Arc<dyn ToolDispatcher>,
        sandbox: Option<&'a SandboxRunner>,
        toolbox: &'a Toolbox,
        llm: &'a LlmClient,
    ) -> Self {
        ActionExecutor {
            index,
            dispatcher,
            sandbox,
            toolbox,
            llm,
        }
    }

    /// Execute a non-terminal command.
    pub async fn execute(
        &self,
        ctx: &RunContext,
        state: &mut PlannerState,
        command: &PlannerCommand,
    ) -> Result<ActionOutcome> {
        ctx.signals.raise_if_exit_requested()?;
        ctx.signals.wait_for_resume().await?;

        match command {
            PlannerCommand::Search {
                reasoning,
                query,
                provider,
                limit,
            } => Ok(self.execute_search(ctx, state, reasoning, query, provider.as_deref(), *limit)),
            PlannerCommand::Tool {
                reasoning,
                tool_id,
                args,
                ..
            } => {
                self.execute_tool(ctx, state, reasoning, tool_id, args.clone())
                    .await
            }
            PlannerCommand::Sandbox {
                reasoning,
                code,
                label,
            } => self.execute_sandbox(ctx, state, reasoning, code, label).await,
            PlannerCommand::InspectToolOutput {
                tool_id,
                field_path,
                max_depth,
                max_fields,
                ..
            } => Ok(self.execute_inspect(state, tool_id, field_path, *max_depth, *max_fields)),
            PlannerCommand::Finish { .. } | PlannerCommand::Fail { .. } => Err(
                crate::error::Error::Internal("terminal commands are handled by the loop".into()),
            ),
        }
    }

    // --- Search ---

    fn execute_search(
        &self,
        ctx: &RunContext,
        state: &mut PlannerState,
        reasoning: &str,
        query: &str,
        provider: Option<&str>,
        limit: Option<usize>,
    ) -> ActionOutcome {
        let results = search_tools(self.index, query, provider, limit);
        state.merge_search_results(&results);

        let found: Vec<Value> = results.iter().map(|d| d.to_value()).collect();
        let tool_ids: Vec<&str> = results.iter().map(|d| d.tool_id.as_str()).collect();
        state.record_event(
            ctx,
            "mcp.search.completed",
            json!({
                "query": query.chars().take(200).collect::<String>(),
                "result_count": results.len(),
                "tool_ids": tool_ids,
            }),
        );

        let preview = if reasoning.is_empty() {
            format!("Found {} tools matching '{}'", results.len(), query)
        } else {
            reasoning.to_string()
        };
        ActionOutcome::success(
            "search",
            json!({"found_tools": found, "count": results.len()}),
            preview,
        )
    }

    // --- Tool invocation ---

    async fn execute_tool(
        &self,
        ctx: &RunContext,
        state: &mut PlannerState,
        reasoning: &str,
        tool_id: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<ActionOutcome> {
        let Some(spec) = self.index.get_tool(tool_id) else {
            return Ok(with_tool_identity(
                ActionOutcome::failure(
                    "tool",
                    "planner_used_unknown_tool",
                    format!("Unknown tool_id '{}'.", tool_id),
                ),
                tool_id,
                None,
                None,
                Some(Value::Object(args)),
            ));
        };

        if state.has_search_steps() && !state.is_discovered(tool_id) {
            return Ok(with_tool_identity(
                ActionOutcome::failure(
                    "tool",
                    "planner_used_undiscovered_tool",
                    format!("Tool '{}' was never discovered via search.", tool_id),
                ),
                tool_id,
                Some(&spec.provider),
                Some(&spec.name),
                Some(Value::Object(args)),
            ));
        }

        let provider = spec.provider.clone();
        let tool_name = spec.name.clone();
        let resolved_tool = self.index.resolve_mcp_tool_name(&provider, &tool_name);
        state.record_event(
            ctx,
            "mcp.action.planned",
            json!({"provider": provider, "tool": resolved_tool}),
        );

        let result_key = format!("tool.{}.{}", provider, resolved_tool);
        let mut clean_payload = args.clone();
        clean_payload.remove("context");
        let payload = Value::Object(clean_payload);

        ctx.signals.raise_if_exit_requested()?;
        ctx.signals.wait_for_resume().await?;

        let envelope = match self
            .dispatcher
            .dispatch_tool(ctx, &provider, &tool_name, payload.clone())
            .await
        {
            Ok(envelope) => envelope,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                let message = e.to_string();
                state.record_event(
                    ctx,
                    "mcp.action.exception",
                    json!({"provider": provider, "tool": resolved_tool, "error": message}),
                );
                return Ok(with_tool_identity(
                    ActionOutcome {
                        preview: format!("{}.{} failed: {}", provider, resolved_tool, message),
                        ..ActionOutcome::failure("tool", "tool_execution_failed", message)
                    },
                    tool_id,
                    Some(&provider),
                    Some(&tool_name),
                    Some(payload),
                ));
            }
        };

        // Owned copies so the observation context can borrow while we mutate
        // state afterwards.
        let task = state.task.clone();
        let higher_task = extra_string(state, "orchestrator_task");
        let higher_trajectory = extra_string(state, "orchestrator_trajectory");
        let obs_ctx = ObservationContext {
            action_type: "tool",
            action_name: &provider,
            action_operation: &tool_name,
            task: &task,
            reasoning,
            input_payload: Some(&payload),
            sandbox_code: None,
            higher_level_task: higher_task.as_deref(),
            higher_level_trajectory: higher_trajectory.as_deref(),
        };

        let processed = match process_tool_observation(ctx, self.llm, &envelope, &obs_ctx).await {
            Ok(processed) => processed,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                return Ok(with_tool_identity(
                    ActionOutcome::failure("tool", "observation_summarizer_failed", e.to_string()),
                    tool_id,
                    Some(&provider),
                    Some(&tool_name),
                    Some(payload),
                ))
            }
        };

        state.append_raw_output(
            &result_key,
            json!({
                "type": "tool",
                "provider": provider,
                "tool": tool_name,
                "payload": payload,
                "response": envelope.to_value(),
            }),
        );
        state.budget_tracker.tool_calls += 1;
        state.record_event(
            ctx,
            "mcp.action.completed",
            json!({"provider": provider, "tool": resolved_tool}),
        );

        let preview = if reasoning.is_empty() {
            format!("{}.{} (successful={})", provider, resolved_tool, envelope.successful)
        } else {
            reasoning.to_string()
        };
        Ok(ActionOutcome {
            kind: "tool",
            success: envelope.successful,
            observation: processed.observation,
            preview,
            raw_output_key: Some(result_key),
            error: if envelope.successful { None } else { envelope.error.clone() },
            error_code: None,
            is_smart_summary: processed.is_smart_summary,
            original_tokens: processed.original_tokens,
            compressed_tokens: processed.compressed_tokens,
            tool_id: Some(tool_id.to_string()),
            provider: Some(provider),
            tool_name: Some(tool_name),
            args: Some(payload),
        })
    }

    // --- Sandbox execution ---

    async fn execute_sandbox(
        &self,
        ctx: &RunContext,
        state: &mut PlannerState,
        reasoning: &str,
        code: &str,
        label: &str,
    ) -> Result<ActionOutcome> {
        if let Some(wrapper) = find_forbidden_wrapper(code) {
            return Ok(ActionOutcome::failure(
                "sandbox",
                "sandbox_invalid_body",
                format!(
                    "Sandbox code must be a statement body; remove the '{}' wrapper.",
                    wrapper
                ),
            ));
        }

        let analysis = match analyze_sandbox(code) {
            Ok(analysis) => analysis,
            Err(e) => {
                let prior_errors = state.sandbox_errors_for_label("sandbox_syntax_error", label);
                state.record_event(
                    ctx,
                    "mcp.sandbox.syntax_error",
                    json!({
                        "label": label,
                        "error": e.to_string(),
                        "code_preview": code.chars().take(4000).collect::<String>(),
                    }),
                );
                let error_text = format!(
                    "Sandbox syntax error: {}. Ensure code has real newlines and escaped quotes",
                    e
                );
                let mut outcome =
                    ActionOutcome::failure("sandbox", "sandbox_syntax_error", error_text);
                outcome.observation = json!({
                    "error": outcome.error,
                    "label": label,
                    "prior_errors": prior_errors,
                    "code_preview": code.chars().take(400).collect::<String>(),
                });
                outcome.raw_output_key = Some(format!("sandbox.{}", label));
                return Ok(outcome);
            }
        };

        for server in &analysis.used_servers {
            let discovered = state
                .search_results()
                .iter()
                .any(|descriptor| &descriptor.server == server);
            if !discovered {
                return Ok(ActionOutcome::failure(
                    "sandbox",
                    "planner_used_unknown_server",
                    format!(
                        "Sandbox used server '{}' which was never discovered via search.",
                        server
                    ),
                ));
            }
        }
        for (server, functions) in &analysis.calls_by_server {
            for function in functions {
                let discovered = state
                    .search_results()
                    .iter()
                    .any(|descriptor| &descriptor.server == server && &descriptor.tool == function);
                if !discovered {
                    return Ok(ActionOutcome::failure(
                        "sandbox",
                        "planner_used_undiscovered_tool",
                        format!(
                            "Sandbox used '{}.{}' which was not in search results.",
                            server, function
                        ),
                    ));
                }
            }
        }

        let Some(sandbox) = self.sandbox else {
            return Ok(ActionOutcome::failure(
                "sandbox",
                "sandbox_runtime_error",
                "Sandbox execution is unavailable: no python interpreter found.",
            ));
        };
        let sandbox_result = match sandbox.run_plan(ctx, self.toolbox, code, label).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                return Ok(ActionOutcome::failure(
                    "sandbox",
                    "sandbox_runtime_error",
                    format!("Sandbox execution failed: {}", e),
                ))
            }
        };

        state.budget_tracker.code_runs += 1;
        state.record_event(
            ctx,
            "mcp.sandbox.run",
            json!({
                "success": sandbox_result.success,
                "timed_out": sandbox_result.timed_out,
                "log_lines": sandbox_result.logs.len(),
                "code_preview": code.chars().take(200).collect::<String>(),
                "label": label,
            }),
        );

        let normalized = unwrap_nested_data(sandbox_result.result.clone().unwrap_or(Value::Null));
        let result_key = format!("sandbox.{}", label);
        let had_tool_calls = !analysis.calls_by_server.is_empty();
        let all_tools_succeeded = check_all_tools_succeeded(&normalized);

        state.append_raw_output(
            &result_key,
            json!({
                "type": "sandbox",
                "label": label,
                "success": sandbox_result.success,
                "timed_out": sandbox_result.timed_out,
                "logs": sandbox_result.logs,
                "error": sandbox_result.error,
                "result": normalized,
                "code_preview": code.chars().take(1200).collect::<String>(),
                "all_tools_succeeded": all_tools_succeeded,
            }),
        );

        // The template converts user exceptions into an error envelope, so a
        // clean exit can still carry a failure result.
        let result_is_error_envelope = normalized
            .get("successful")
            .and_then(Value::as_bool)
            .map(|successful| !successful)
            .unwrap_or(false)
            && normalized.get("error").map(|e| !e.is_null()).unwrap_or(false);

        if sandbox_result.success && !sandbox_result.timed_out && !result_is_error_envelope {
            let task = state.task.clone();
            let higher_task = extra_string(state, "orchestrator_task");
            let higher_trajectory = extra_string(state, "orchestrator_trajectory");
            let obs_ctx = ObservationContext {
                action_type: "sandbox",
                action_name: label,
                action_operation: label,
                task: &task,
                reasoning,
                input_payload: None,
                sandbox_code: Some(code),
                higher_level_task: higher_task.as_deref(),
                higher_level_trajectory: higher_trajectory.as_deref(),
            };
            let processed =
                match process_sandbox_observation(ctx, self.llm, &normalized, &obs_ctx).await {
                    Ok(processed) => processed,
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        let mut outcome = ActionOutcome::failure(
                            "sandbox",
                            "observation_summarizer_failed",
                            e.to_string(),
                        );
                        outcome.raw_output_key = Some(result_key);
                        return Ok(outcome);
                    }
                };

            let mut observation = processed.observation;
            if let Value::Object(ref mut map) = observation {
                if !map.contains_key("error") {
                    let empty_result =
                        had_tool_calls && map.iter().all(|(key, _)| key.starts_with('_'));
                    map.insert(
                        "_all_tools_succeeded".into(),
                        json!(all_tools_succeeded && !empty_result),
                    );
                    if empty_result {
                        map.insert("warning".into(), json!("sandbox_empty_result"));
                    }
                }
            }

            let preview = if reasoning.is_empty() {
                format!("Sandbox '{}' success", label)
            } else {
                reasoning.to_string()
            };
            return Ok(ActionOutcome {
                kind: "sandbox",
                success: true,
                observation,
                preview,
                raw_output_key: Some(result_key),
                error: None,
                error_code: None,
                is_smart_summary: processed.is_smart_summary,
                original_tokens: processed.original_tokens,
                compressed_tokens: processed.compressed_tokens,
                tool_id: None,
                provider: None,
                tool_name: None,
                args: None,
            });
        }

        // Failure path: surface error, logs, and traceback in the observation.
        let mut error_details = sandbox_result
            .error
            .clone()
            .unwrap_or_else(|| {
                if sandbox_result.timed_out {
                    "sandbox timed out".to_string()
                } else {
                    "sandbox_execution_failed".to_string()
                }
            });
        let mut logs: Vec<Value> = sandbox_result
            .logs
            .iter()
            .take(MAX_OBSERVATION_LOG_LINES)
            .map(|line| json!(line))
            .collect();
        if sandbox_result.logs.len() > MAX_OBSERVATION_LOG_LINES {
            logs.push(json!("... (truncated)"));
        }
        let mut error_payload = json!({
            "error": error_details,
            "logs": logs,
            "timed_out": sandbox_result.timed_out,
        });
        if let Value::Object(ref map) = normalized {
            if let Some(traceback) = map.get("traceback") {
                error_payload["traceback"] = traceback.clone();
            }
            if let Some(message) = map.get("error").and_then(Value::as_str) {
                error_details = message.to_string();
                error_payload["error"] = json!(error_details);
            }
        }

        let error_code = if sandbox_result.timed_out {
            "sandbox_timeout"
        } else {
            "sandbox_runtime_error"
        };
        let preview = if reasoning.is_empty() {
            format!(
                "Sandbox '{}' failed: {}",
                label,
                error_details.chars().take(100).collect::<String>()
            )
        } else {
            reasoning.to_string()
        };
        Ok(ActionOutcome {
            kind: "sandbox",
            success: false,
            observation: error_payload,
            preview,
            raw_output_key: Some(result_key),
            error: Some(error_details),
            error_code: Some(error_code.to_string()),
            is_smart_summary: false,
            original_tokens: 0,
            compressed_tokens: 0,
            tool_id: None,
            provider: None,
            tool_name: None,
            args: None,
        })
    }

    // --- Output schema inspection ---

    fn execute_inspect(
        &self,
        state: &PlannerState,
        tool_id: &str,
        field_path: &str,
        max_depth: u32,
        max_fields: u32,
    ) -> ActionOutcome {
        let Some(spec) = self.index.get_tool(tool_id) else {
            return ActionOutcome::failure(
                "inspect_tool_output",
                "planner_used_unknown_tool",
                format!("Unknown tool_id '{}'.", tool_id),
            );
        };

        // Only paths surfaced in a fold marker may be inspected.
        if !field_path.is_empty() {
            let seen = state.seen_fold_paths(tool_id);
            let known = seen
                .iter()
                .any(|path| path == field_path || field_path.starts_with(path.as_str()));
            if !known {
                return ActionOutcome::failure(
                    "inspect_tool_output",
                    "inspect_unknown_field_path",
                    format!(
                        "Field path '{}' was never surfaced as a fold marker for '{}'.",
                        field_path, tool_id
                    ),
                );
            }
        }

        let observation = spec.inspect_output(field_path, max_depth as usize, max_fields as usize);
        ActionOutcome::success(
            "inspect_tool_output",
            observation,
            format!("Inspected {} at '{}'", tool_id, field_path),
        )
    }
}

fn with_tool_identity(
    mut outcome: ActionOutcome,
    tool_id: &str,
    provider: Option<&str>,
    tool_name: Option<&str>,
    args: Option<Value>,
) -> ActionOutcome {
    outcome.tool_id = Some(tool_id.to_string());
    outcome.provider = provider.map(str::to_string);
    outcome.tool_name = tool_name.map(str::to_string);
    outcome.args = args;
    outcome
}

fn extra_string(state: &PlannerState, key: &str) -> Option<String> {
    state
        .extra_context
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Recursive check that every embedded tool envelope reports success.
///
/// When no envelopes are present, a result with meaningful content counts as
/// success; an explicit top-level error never does.
pub fn check_all_tools_succeeded(result: &Value) -> bool {
    let Value::Object(map) = result else {
        return false;
    };
    if map.get("error").map(|e| truthy(e)).unwrap_or(false) {
        return false;
    }

    let mut found_any = false;
    let mut all_ok = true;
    visit_envelopes(result, &mut found_any, &mut all_ok);
    if found_any {
        return all_ok;
    }

    map.iter()
        .any(|(key, value)| key != "_all_tools_succeeded" && truthy(value))
}

fn visit_envelopes(value: &Value, found_any: &mut bool, all_ok: &mut bool) {
    match value {
        Value::Object(map) => {
            if is_envelope(value) {
                *found_any = true;
                let successful = map
                    .get("successful")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !successful {
                    *all_ok = false;
                }
            }
            for child in map.values() {
                visit_envelopes(child, found_any, all_ok);
            }
        }
        Value::Array(items) => {
            for item in items {
                visit_envelopes(item, found_any, all_ok);
            }
        }
        _ => {}
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_all_tools_succeeded_with_envelopes() {
        let result = json!({
            "emails": {"successful": true, "data": {"count": 3}, "error": null},
            "post": {"successful": true, "data": {"ok": true}, "error": null},
        });
        assert!(check_all_tools_succeeded(&result));

        let result = json!({
            "emails": {"successful": true, "data": {}, "error": null},
            "post": {"successful": false, "data": null, "error": "denied"},
        });
        assert!(!check_all_tools_succeeded(&result));
    }

    #[test]
    fn test_all_tools_succeeded_nested_in_arrays() {
        let result = json!({
            "batches": [
                {"successful": true, "data": {}, "error": null},
                {"successful": false, "data": null, "error": "rate limited"},
            ],
        });
        assert!(!check_all_tools_succeeded(&result));
    }

    #[test]
    fn test_all_tools_succeeded_without_envelopes() {
        // Extracted fields, no envelopes: meaningful content counts.
        assert!(check_all_tools_succeeded(&json!({"count": 3, "ids": ["a"]})));
        assert!(!check_all_tools_succeeded(&json!({})));
        assert!(!check_all_tools_succeeded(&json!({"error": "boom"})));
        assert!(!check_all_tools_succeeded(&json!("not a dict")));
    }
}
