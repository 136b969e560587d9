//! End-to-end planner loop scenarios with scripted LLM backends.

mod common;

use serde_json::{json, Map};
use std::sync::Arc;

use common::{gmail_index, python_available, run_context_with_dir, ScriptedBackend, StubDispatcher};
use foreman::catalog::ToolIndex;
use foreman::config::Config;
use foreman::dispatch::Envelope;
use foreman::llm::LlmClient;
use foreman::planner::{execute_mcp_task, Budget, PlannerDeps};

fn command(value: serde_json::Value) -> String {
    value.to_string()
}

async fn run_planner(
    backend: Arc<ScriptedBackend>,
    index: &ToolIndex,
    dispatcher: Arc<StubDispatcher>,
    task: &str,
    budget: Budget,
) -> foreman::planner::McpTaskResult {
    let (_dir, ctx) = run_context_with_dir();
    let llm = LlmClient::new(backend, "test-model");
    let config = Config::minimal();
    let deps = PlannerDeps {
        llm: &llm,
        index,
        dispatcher,
        sandbox_config: &config.sandbox,
        tool_constraints: None,
    };
    execute_mcp_task(&ctx, deps, task, budget, Map::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_pure_analysis_no_tools() {
    // Task: sorted unique values of a list. One sandbox step, one finish.
    if !python_available() {
        return;
    }

    let backend = ScriptedBackend::new(vec![
        command(json!({
            "type": "sandbox",
            "reasoning": "Pure computation, no tools needed",
            "label": "analysis",
            "code": "values = sorted(set([3, 1, 4, 1, 5, 9, 2, 6]))\nreturn {\"sorted_unique\": values}",
        })),
        command(json!({
            "type": "finish",
            "reasoning": "Computed the sorted unique values",
            "summary": "Sorted unique values: [1, 2, 3, 4, 5, 6, 9]",
        })),
    ]);

    let index = gmail_index();
    let dispatcher = StubDispatcher::new();
    let result = run_planner(
        Arc::clone(&backend),
        &index,
        Arc::clone(&dispatcher),
        "Given the list [3,1,4,1,5,9,2,6], return the sorted unique values.",
        Budget::default(),
    )
    .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[0]["type"], "sandbox");
    assert_eq!(result.steps[0]["success"], true);
    assert_eq!(result.steps[1]["type"], "finish");
    // No tool calls were made.
    assert_eq!(dispatcher.call_count(), 0);
    // The trajectory reconstructs the code execution.
    assert!(result.trajectory_md.contains("### Step 1: Sandbox Execution"));
    assert!(result.trajectory_md.contains("sorted(set("));
    assert!(result.trajectory_md.contains("sorted_unique"));
}

#[tokio::test]
async fn test_retrieve_then_finish() {
    // search -> tool(gmail.gmail_search) -> finish.
    let backend = ScriptedBackend::new(vec![
        command(json!({
            "type": "search",
            "reasoning": "Need the Gmail search tool",
            "query": "gmail recent emails",
        })),
        command(json!({
            "type": "tool",
            "reasoning": "Fetch the three most recent emails from alice",
            "tool_id": "gmail.gmail_search",
            "server": "gmail",
            "args": {"query": "from:alice@example.com", "max_results": 3},
        })),
        command(json!({
            "type": "finish",
            "reasoning": "Retrieved the emails",
            "summary": "Found 3 recent emails from alice@example.com",
        })),
    ]);

    let index = gmail_index();
    let dispatcher = StubDispatcher::with_response(
        "gmail",
        "gmail_search",
        Envelope::success(json!({
            "messages": [
                {"messageId": "m1", "subject": "Q1 report"},
                {"messageId": "m2", "subject": "Re: lunch"},
                {"messageId": "m3", "subject": "Invoice"},
            ],
            "resultSizeEstimate": 3,
        })),
    );

    let result = run_planner(
        Arc::clone(&backend),
        &index,
        Arc::clone(&dispatcher),
        "Find the three most recent emails from alice@example.com.",
        Budget::default(),
    )
    .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.steps.len(), 3);
    assert_eq!(result.steps[0]["type"], "search");
    assert_eq!(result.steps[1]["type"], "tool");
    assert_eq!(result.steps[1]["command"]["tool_id"], "gmail.gmail_search");
    assert_eq!(result.steps[2]["type"], "finish");

    // The dispatcher saw exactly one call with the planner's args.
    let calls = dispatcher.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "gmail");
    assert_eq!(calls[0].1, "gmail_search");
    assert_eq!(calls[0].2["query"], "from:alice@example.com");

    // Raw output retained under the resolved tool key.
    assert!(result.raw_outputs.contains_key("tool.gmail.GMAIL_SEARCH"));
    // Markdown is self-contained: call, args, and response all present.
    assert!(result.trajectory_md.contains("### Step 2: Tool Call - gmail.gmail_search"));
    assert!(result.trajectory_md.contains("from:alice@example.com"));
    assert!(result.trajectory_md.contains("Q1 report"));
}

#[tokio::test]
async fn test_unknown_tool_guard_fails_cleanly() {
    // No authorized providers: planner searches, finds nothing, fails.
    let backend = ScriptedBackend::new(vec![
        command(json!({
            "type": "search",
            "reasoning": "Look for an email capability",
            "query": "send email gmail",
        })),
        command(json!({
            "type": "search",
            "reasoning": "Try broader terms",
            "query": "email",
        })),
        command(json!({
            "type": "fail",
            "reasoning": "No email capability is available",
            "reason": "No Gmail capability is authorized for this user.",
        })),
    ]);

    let index = ToolIndex::new(); // nothing registered, nothing authorized
    let dispatcher = StubDispatcher::new();
    let result = run_planner(
        backend,
        &index,
        dispatcher,
        "Send an email to bob@example.com.",
        Budget::default(),
    )
    .await;

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("planner_fail_action"));
    assert!(result.final_summary.contains("Gmail capability"));
}

#[tokio::test]
async fn test_budget_exhaustion_max_steps() {
    // Three searches allowed, then the budget gate fires before a 4th call.
    let search = command(json!({
        "type": "search",
        "reasoning": "keep exploring",
        "query": "more tools",
    }));
    let backend = ScriptedBackend::new(vec![search.clone(), search.clone(), search]);

    let index = gmail_index();
    let dispatcher = StubDispatcher::new();
    let result = run_planner(
        Arc::clone(&backend),
        &index,
        dispatcher,
        "A task that needs at least five steps.",
        Budget {
            max_steps: 3,
            ..Budget::default()
        },
    )
    .await;

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("budget_exceeded"));
    assert_eq!(result.final_summary, "Budget exceeded: max_steps");
    let details = result.error_details.unwrap();
    assert_eq!(details["budget_type"], "max_steps");
    // Exactly three LLM calls happened before the cap.
    assert_eq!(backend.request_count(), 3);
}

#[tokio::test]
async fn test_run_wide_cost_does_not_trip_delegation_budget() {
    // The cost cap is per delegation: spending already accumulated on the
    // run-wide tracker (outer decisions, translator, earlier delegations)
    // must not exhaust a fresh delegation's budget before it does any work.
    let (_dir, ctx) = run_context_with_dir();
    // Well past the default 0.50 USD planner cap.
    ctx.cost.record_usage(
        "openai/o4-mini",
        "orchestrator.decide",
        &foreman::llm::Usage {
            cached_input_tokens: 0,
            new_input_tokens: 600_000_000,
            output_tokens: 0,
        },
    );
    assert!(ctx.cost.total_cost_usd() > 0.50);

    let backend = ScriptedBackend::new(vec![command(json!({
        "type": "finish",
        "reasoning": "nothing to do",
        "summary": "Done immediately",
    }))]);
    let llm = LlmClient::new(Arc::clone(&backend) as Arc<dyn foreman::llm::LlmBackend>, "test-model");
    let index = gmail_index();
    let dispatcher = StubDispatcher::new();
    let config = Config::minimal();
    let deps = PlannerDeps {
        llm: &llm,
        index: &index,
        dispatcher,
        sandbox_config: &config.sandbox,
        tool_constraints: None,
    };

    let result = execute_mcp_task(&ctx, deps, "trivial task", Budget::default(), Map::new())
        .await
        .unwrap();

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(backend.request_count(), 1);
    // The delegation's own budget usage reflects only its single call.
    let spent = result.budget_usage["estimated_llm_cost_usd"].as_f64().unwrap();
    assert!(spent < 0.50, "delegation cost was {}", spent);
}

#[tokio::test]
async fn test_zero_step_budget_makes_no_llm_calls() {
    let backend = ScriptedBackend::new(vec![]);
    let index = gmail_index();
    let dispatcher = StubDispatcher::new();
    let result = run_planner(
        Arc::clone(&backend),
        &index,
        dispatcher,
        "anything",
        Budget {
            max_steps: 0,
            ..Budget::default()
        },
    )
    .await;

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("budget_exceeded"));
    assert_eq!(result.final_summary, "Budget exceeded: max_steps");
    assert_eq!(backend.request_count(), 0);
}

#[tokio::test]
async fn test_sandbox_invalid_body_recovers() {
    // First sandbox smuggles a forbidden wrapper; the loop continues and the
    // second, valid body succeeds.
    if !python_available() {
        return;
    }

    let backend = ScriptedBackend::new(vec![
        command(json!({
            "type": "sandbox",
            "reasoning": "compute",
            "label": "calc",
            "code": "async def main():\n    return {\"x\": 1}",
        })),
        command(json!({
            "type": "sandbox",
            "reasoning": "compute without the wrapper",
            "label": "calc",
            "code": "return {\"x\": 1}",
        })),
        command(json!({
            "type": "finish",
            "reasoning": "done",
            "summary": "Computed x=1",
        })),
    ]);

    let index = gmail_index();
    let dispatcher = StubDispatcher::new();
    let result = run_planner(
        backend,
        &index,
        dispatcher,
        "Compute x.",
        Budget::default(),
    )
    .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.steps.len(), 3);
    assert_eq!(result.steps[0]["success"], false);
    assert_eq!(result.steps[0]["error"], "sandbox_invalid_body");
    assert_eq!(result.steps[1]["success"], true);
}

#[tokio::test]
async fn test_sandbox_syntax_error_backpressure() {
    // Three syntax errors with the same label: first two recoverable, the
    // third terminates the planner.
    let bad = |label: &str| {
        command(json!({
            "type": "sandbox",
            "reasoning": "try computing",
            "label": label,
            "code": "x = (1 + 2",
        }))
    };
    let backend = ScriptedBackend::new(vec![bad("calc"), bad("calc"), bad("calc")]);

    let index = gmail_index();
    let dispatcher = StubDispatcher::new();
    let result = run_planner(
        backend,
        &index,
        dispatcher,
        "Compute something.",
        Budget::default(),
    )
    .await;

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("sandbox_syntax_error"));
    // All three failed attempts are in history.
    let syntax_steps = result
        .steps
        .iter()
        .filter(|s| s["error"] == "sandbox_syntax_error")
        .count();
    assert_eq!(syntax_steps, 3);
}

#[tokio::test]
async fn test_undiscovered_tool_after_search_is_fatal() {
    let backend = ScriptedBackend::new(vec![
        command(json!({
            "type": "search",
            "reasoning": "find email tools",
            "query": "slack messages",
        })),
        command(json!({
            "type": "tool",
            "reasoning": "call the send tool directly",
            "tool_id": "gmail.gmail_send_email",
            "server": "gmail",
            "args": {"to": "bob@example.com", "subject": "hi", "body": "hello"},
        })),
    ]);

    let index = gmail_index();
    let dispatcher = StubDispatcher::new();
    let result = run_planner(
        backend,
        &index,
        Arc::clone(&dispatcher),
        "Send an email.",
        Budget::default(),
    )
    .await;

    assert!(!result.success);
    assert_eq!(
        result.error_code.as_deref(),
        Some("planner_used_undiscovered_tool")
    );
    // Discovery discipline: the dispatcher never ran.
    assert_eq!(dispatcher.call_count(), 0);
}

#[tokio::test]
async fn test_parse_error_after_retry_is_terminal() {
    let backend = ScriptedBackend::new(vec![
        "this is not a command".to_string(),
        "still not json".to_string(),
    ]);
    let index = gmail_index();
    let dispatcher = StubDispatcher::new();
    let result = run_planner(
        backend,
        &index,
        dispatcher,
        "anything",
        Budget::default(),
    )
    .await;

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("planner_parse_error"));
}

#[tokio::test]
async fn test_step_indices_monotonic() {
    let backend = ScriptedBackend::new(vec![
        command(json!({"type": "search", "reasoning": "r", "query": "gmail"})),
        command(json!({"type": "search", "reasoning": "r", "query": "gmail search"})),
        command(json!({"type": "finish", "reasoning": "r", "summary": "done"})),
    ]);
    let index = gmail_index();
    let dispatcher = StubDispatcher::new();
    let result = run_planner(
        backend,
        &index,
        dispatcher,
        "look around",
        Budget::default(),
    )
    .await;

    let indices: Vec<u64> = result
        .steps
        .iter()
        .map(|s| s["index"].as_u64().unwrap())
        .collect();
    assert_eq!(indices, vec![0, 1, 2]);
}
