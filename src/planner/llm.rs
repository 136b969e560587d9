//! Planner LLM interface.
//!
//! Formats planner state into the fixed three-message conversation and
//! issues one JSON-mode call per loop iteration.

use serde_json::{json, Value};

use crate::context::RunContext;
use crate::error::Result;
use crate::llm::{GenerationOptions, LlmClient, LlmRequest, Message, ReasoningEffort};
use crate::planner::prompts::PLANNER_PROMPT;
use crate::planner::state::PlannerState;

/// Output ceiling for planner decisions
const PLANNER_MAX_OUTPUT_TOKENS: u32 = 10_000;

/// Issues planner decisions through the LLM facade.
pub struct PlannerLlm<'a> {
    client: &'a LlmClient,
}

impl<'a> PlannerLlm<'a> {
    /// Wrap the facade
    pub fn new(client: &'a LlmClient) -> Self {
        PlannerLlm { client }
    }

    /// Ask for the next command; returns the raw assistant text.
    ///
    /// This delegation's cost total is folded back into the planner budget
    /// tracker after the call so the cost cap engages on the next iteration.
    /// The cap reads the session's own `token_tracker`, never the run-wide
    /// total, so outer-loop spending cannot exhaust an inner budget.
    pub async fn next_command_text(
        &self,
        ctx: &RunContext,
        state: &mut PlannerState,
    ) -> Result<String> {
        let messages = build_messages(state);
        let request = LlmRequest {
            model: self.client.default_model().to_string(),
            messages,
            options: GenerationOptions {
                json_mode: true,
                max_output_tokens: Some(PLANNER_MAX_OUTPUT_TOKENS),
                reasoning_effort: Some(ReasoningEffort::High),
                ..Default::default()
            },
        };

        let response = self.client.generate(ctx, "planner.llm", request).await?;
        let delegation_cost = state.token_tracker.total_cost_usd();
        state.budget_tracker.update_llm_cost(delegation_cost);
        state.record_event(
            ctx,
            "mcp.llm.completed",
            json!({"model": response.model, "output_chars": response.text.len()}),
        );
        Ok(response.text)
    }
}

/// Build the three-message planner conversation:
/// system prompt, developer `PLANNER_STATE_JSON`, user task payload.
pub fn build_messages(state: &PlannerState) -> Vec<Message> {
    let state_json =
        serde_json::to_string_pretty(&state.build_planner_state()).unwrap_or_default();
    let user_payload = json!({
        "task": state.task,
        "extra_context": Value::Object(state.extra_context.clone()),
    });
    vec![
        Message::system(PLANNER_PROMPT),
        Message::developer(format!("PLANNER_STATE_JSON\n{}", state_json)),
        Message::user(user_payload.to_string()),
    ]
}
