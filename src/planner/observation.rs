//! Task-aware observation summarization.
//!
//! Large tool and sandbox payloads are compressed by an LLM before entering
//! planner context. Payloads under the per-type threshold pass through
//! unchanged. There is no fallback: if the summarizer call or its JSON parse
//! fails, the containing step fails.

use serde_json::{json, Value};

use crate::context::RunContext;
use crate::dispatch::Envelope;
use crate::error::{Error, Result};
use crate::llm::{GenerationOptions, LlmClient, LlmRequest, Message, ReasoningEffort};
use crate::tokens::count_json_tokens;

/// Tool payloads at or above this token count get summarized
pub const TOOL_SUMMARY_THRESHOLD: u64 = 8_000;
/// Sandbox payloads at or above this token count get summarized
pub const SANDBOX_SUMMARY_THRESHOLD: u64 = 10_000;
/// Target compression ratio relative to the original payload
pub const COMPRESSION_TARGET: f64 = 0.60;
/// Headroom over the target so generation is not cut off mid-JSON
pub const OUTPUT_HEADROOM: f64 = 1.2;

/// Fixed system prompt for the summarizer.
const SUMMARIZATION_SYSTEM_PROMPT: &str = r#"You are the "Task-Aware Action Result Extractor".

GOAL
Given a plain-English TASK, an ACTION_TYPE ("tool" or "sandbox"), the ACTION_INPUT payload, and a large ACTION_RESULT_JSON payload, extract ONLY the information relevant to completing the TASK. Do NOT preserve the original JSON structure. Do NOT copy large portions of the payload.

WHAT "RELEVANT" MEANS
- Primary entities referenced by the task (IDs, names, emails, URLs, timestamps, amounts, statuses)
- Fields needed for the next action (record identifiers, required parameters, pagination tokens)
- Results, outcomes, confirmations (created/updated item IDs, URLs, state transitions)
- Errors that block progress (codes, messages, missing permissions) plus any remediation hints present

HIGHER LEVEL CONTEXT
The user message may include a HIGHER LEVEL TASK and HIGHER LEVEL TRAJECTORY from the orchestrator. Use them only to judge relevance; do not treat them as new data.

EXCLUDE AGGRESSIVELY
Formatting metadata, boilerplate, verbose logs, raw HTML, and any content not clearly connected to the TASK. Summarize huge arrays as counts plus up to 5 representative items.

REDACTION
Never output secrets: access tokens, refresh tokens, API keys, cookies, Authorization headers. Replace with "[REDACTED]".

OUTPUT FORMAT (MUST FOLLOW)
Return VALID JSON ONLY (no markdown, no prose), exactly:
{
  "success": boolean,
  "data": {
    "status": "success" | "error" | "partial" | "unknown",
    "key_facts": { ... },
    "records": [ { ... } ],
    "excerpts": [ { "text": string, "path": string } ],
    "pagination": { "next_page_token": string|null, "has_more": boolean|null },
    "errors": [ { "code": string|null, "message": string, "path": string|null } ],
    "paths_used": [ string ],
    "omitted_summary": string,
    "missing": [ string ]
  },
  "error": boolean
}
Omit data keys that do not apply. Include top-level "error": true only when an error was encountered."#;

/// Identity and context of the action whose result is being summarized.
pub struct ObservationContext<'a> {
    /// "tool" or "sandbox"
    pub action_type: &'a str,
    /// Provider/tool name or sandbox label
    pub action_name: &'a str,
    /// Specific operation when distinct from the name
    pub action_operation: &'a str,
    /// The planner's task
    pub task: &'a str,
    /// Planner reasoning for this step
    pub reasoning: &'a str,
    /// Tool input payload (tool results only)
    pub input_payload: Option<&'a Value>,
    /// Sandbox code body (sandbox results only)
    pub sandbox_code: Option<&'a str>,
    /// Higher-level orchestrator task, when running under the outer loop
    pub higher_level_task: Option<&'a str>,
    /// Higher-level orchestrator trajectory
    pub higher_level_trajectory: Option<&'a str>,
}

/// Result of observation processing.
pub struct ProcessedObservation {
    /// Observation to record on the step
    pub observation: Value,
    /// Whether it passed through the LLM summarizer
    pub is_smart_summary: bool,
    /// Token count before summarization
    pub original_tokens: u64,
    /// Token count after summarization
    pub compressed_tokens: u64,
}

/// Process a tool result envelope.
///
/// Unsuccessful envelopes short-circuit to a compact error observation;
/// successful payloads below the threshold pass through unchanged.
pub async fn process_tool_observation(
    ctx: &RunContext,
    llm: &LlmClient,
    envelope: &Envelope,
    obs: &ObservationContext<'_>,
) -> Result<ProcessedObservation> {
    if !envelope.successful {
        let error_data = json!({
            "successful": false,
            "error": envelope.error.clone().unwrap_or_else(|| "Unknown failure".to_string()),
        });
        let tokens = count_json_tokens(&error_data);
        return Ok(ProcessedObservation {
            observation: error_data,
            is_smart_summary: false,
            original_tokens: tokens,
            compressed_tokens: tokens,
        });
    }

    let data = envelope.data.clone();
    let token_count = count_json_tokens(&data);
    ctx.emit(
        "mcp.observation.tool_tokens",
        json!({"token_count": token_count, "threshold": TOOL_SUMMARY_THRESHOLD}),
    );

    if token_count < TOOL_SUMMARY_THRESHOLD {
        return Ok(ProcessedObservation {
            observation: data,
            is_smart_summary: false,
            original_tokens: token_count,
            compressed_tokens: token_count,
        });
    }

    let summarized = summarize_observation(ctx, llm, &data, "tool_result", token_count, obs).await?;
    let compressed_tokens = count_json_tokens(&summarized);
    Ok(ProcessedObservation {
        observation: summarized,
        is_smart_summary: true,
        original_tokens: token_count,
        compressed_tokens,
    })
}

/// Process a sandbox result payload (full result object, no unwrapping).
pub async fn process_sandbox_observation(
    ctx: &RunContext,
    llm: &LlmClient,
    result: &Value,
    obs: &ObservationContext<'_>,
) -> Result<ProcessedObservation> {
    let token_count = count_json_tokens(result);
    ctx.emit(
        "mcp.observation.sandbox_tokens",
        json!({"token_count": token_count, "threshold": SANDBOX_SUMMARY_THRESHOLD}),
    );

    if token_count < SANDBOX_SUMMARY_THRESHOLD {
        return Ok(ProcessedObservation {
            observation: result.clone(),
            is_smart_summary: false,
            original_tokens: token_count,
            compressed_tokens: token_count,
        });
    }

    let summarized =
        summarize_observation(ctx, llm, result, "sandbox_result", token_count, obs).await?;
    let compressed_tokens = count_json_tokens(&summarized);
    Ok(ProcessedObservation {
        observation: summarized,
        is_smart_summary: true,
        original_tokens: token_count,
        compressed_tokens,
    })
}

/// Invoke the LLM summarizer; fails fast on call or parse errors.
async fn summarize_observation(
    ctx: &RunContext,
    llm: &LlmClient,
    payload: &Value,
    payload_type: &str,
    original_tokens: u64,
    obs: &ObservationContext<'_>,
) -> Result<Value> {
    let target_tokens = (original_tokens as f64 * COMPRESSION_TARGET) as u32;
    let max_output = (target_tokens as f64 * OUTPUT_HEADROOM) as u32;

    let payload_json = serde_json::to_string_pretty(payload).map_err(|e| {
        Error::Internal(format!("Cannot serialize payload for summarization: {}", e))
    })?;

    let input_payload_json = match (obs.input_payload, obs.sandbox_code) {
        (Some(input), _) => serde_json::to_string_pretty(input).unwrap_or_else(|_| "null".into()),
        (None, Some(code)) => json!({ "code": code }).to_string(),
        (None, None) => "null".to_string(),
    };

    let user_message = format!(
        "Extract task-relevant information from this action result.\n\n\
         TASK:\n{task}\n\n\
         HIGHER LEVEL TASK:\n{higher_task}\n\n\
         HIGHER LEVEL TRAJECTORY:\n{higher_trajectory}\n\n\
         ACTION_TYPE:\n{action_type}\n\n\
         ACTION:\n{{name: {name:?}, operation: {operation:?}}}\n\n\
         ACTION_INPUT_PAYLOAD_JSON:\n{input}\n\n\
         REASONING BEHIND THE ACTION:\n{reasoning}\n\n\
         ACTION_RESULT_JSON:\n{payload}\n\n\
         Requirements:\n\
         - Output valid JSON only, following the output rules in the system instructions.\n\
         - Do NOT copy the payload.\n\
         - Use ACTION_INPUT only to interpret/prioritize what matters.\n\
         - Include only the minimum info needed to proceed on the TASK.\n",
        task = obs.task,
        higher_task = obs.higher_level_task.unwrap_or("None"),
        higher_trajectory = obs.higher_level_trajectory.unwrap_or("None"),
        action_type = obs.action_type,
        name = obs.action_name,
        operation = obs.action_operation,
        input = input_payload_json,
        reasoning = obs.reasoning,
        payload = payload_json,
    );

    let request = LlmRequest {
        model: llm.default_model().to_string(),
        messages: vec![
            Message::system(SUMMARIZATION_SYSTEM_PROMPT),
            Message::user(user_message),
        ],
        options: GenerationOptions {
            json_mode: true,
            max_output_tokens: Some(max_output.max(256)),
            reasoning_effort: Some(ReasoningEffort::Low),
            ..Default::default()
        },
    };

    let label = format!("observation.processor.{}", payload_type);
    let response = llm.generate(ctx, &label, request).await.map_err(|e| {
        ctx.emit(
            "mcp.observation_processor.failed",
            json!({"error": e.to_string(), "type": payload_type}),
        );
        e
    })?;

    let compressed: Value = serde_json::from_str(response.text.trim()).map_err(|e| {
        ctx.emit(
            "mcp.observation_processor.invalid_json",
            json!({"error": e.to_string(), "type": payload_type}),
        );
        Error::Llm(format!("summarizer returned invalid JSON: {}", e))
    })?;

    let compressed_tokens = count_json_tokens(&compressed);
    let reduction = if original_tokens > 0 {
        (original_tokens.saturating_sub(compressed_tokens)) as f64 / original_tokens as f64 * 100.0
    } else {
        0.0
    };
    ctx.emit(
        "mcp.observation_processor.completed",
        json!({
            "type": payload_type,
            "original_tokens": original_tokens,
            "compressed_tokens": compressed_tokens,
            "reduction_percent": (reduction * 10.0).round() / 10.0,
            "target_tokens": target_tokens,
        }),
    );

    Ok(compressed)
}
