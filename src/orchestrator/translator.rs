//! Trajectory translation.
//!
//! Converts a self-contained markdown trajectory from either sub-agent into
//! the canonical JSON the orchestrator reasons over. The primary path is an
//! LLM call with strict required-field validation; a deterministic parser
//! covers LLM failure. Translation is never fatal.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::llm::{GenerationOptions, LlmClient, LlmRequest, Message, ReasoningEffort};
use crate::orchestrator::types::AgentTarget;

/// Fields every translation must carry.
const REQUIRED_FIELDS: &[&str] = &[
    "task",
    "overall_success",
    "summary",
    "total_steps",
    "steps_summary",
    "artifacts",
];

/// Output ceiling for translations
const TRANSLATOR_MAX_OUTPUT_TOKENS: u32 = 16_000;

/// System prompt for the translator LLM.
pub const TRANSLATOR_SYSTEM_PROMPT: &str = r#"You are a translator that converts self-contained markdown trajectories from worker agents into a canonical JSON format for the orchestrator.

You receive execution trajectories from either:
1. MCP Agent - API-based tool execution. Steps look like:
   `### Step N: Search - provider` with **Query**/**Found**/**Tools** lines,
   `### Step N: Tool Call - tool.id` with **Arguments** and **Response** JSON blocks,
   `### Step N: Sandbox Execution` with **Code** (python) and **Output** JSON blocks,
   `### Step N: Inspect Tool Output - tool.id` with an **Observation** block,
   `### Step N: Completion|Failure` with **Reasoning**/**Summary**/**Error** lines.
2. Computer-Use Agent - desktop automation. Steps look like:
   `## Step N` with **Plan**/**Action**/**Execution Result** blocks, narrator **Observation** lines, and a final `## Final Status` with **Status** and **Completion Reason** lines.

The trajectory is COMPLETE and self-contained - there are no other inputs. Extract and organize it without inventing or omitting task-relevant information. Keep key fields exact (IDs, timestamps, subjects, senders, counts, statuses); summarize long free-form text into task-relevant facts.

Rules:
- NEVER fabricate data, counts, or values not in the trajectory; use null for missing information.
- Count step headers accurately.
- failed_step_index is the 1-based index of the first failed step, null on success.
- last_step_failed is true ONLY if the final step shows failure.
- steps_summary has exactly total_steps entries: "Step N: [action]. [outcome]".

Output this EXACT JSON structure with ALL fields (data is optional and only for fetch/read operations):

{
  "task": "string",
  "overall_success": boolean,
  "summary": "2-3 sentences describing the full execution",
  "error": "string | null",
  "error_code": "string | null",
  "last_step_failed": boolean,
  "failed_step_index": integer | null,
  "total_steps": integer,
  "steps_summary": ["Step N: action taken. Outcome observed."],
  "data": { "...task-relevant retrieved data, summarized..." },
  "artifacts": {
    "tool_calls": [{"tool_id": "string", "arguments": {}, "response": {}, "success": boolean}],
    "ui_observations": ["string"],
    "code_executions": [{"code": "string", "output": {}, "success": boolean}],
    "search_results": [{"query": "string", "tools_found": integer, "tool_names": ["string"]}]
  }
}

Return ONLY valid JSON."#;

/// Translate a trajectory into canonical JSON.
///
/// Passing `llm: None` (or any LLM/validation failure) uses the
/// deterministic fallback parser.
pub async fn translate_step_output(
    ctx: &RunContext,
    llm: Option<&LlmClient>,
    task: &str,
    target: AgentTarget,
    trajectory: &str,
) -> Value {
    if let Some(client) = llm {
        match translate_with_llm(ctx, client, task, target, trajectory).await {
            Ok(translated) => return translated,
            Err(reason) => {
                warn!("Translator LLM path failed ({}); using fallback", reason);
            }
        }
    }
    debug!("Translator using deterministic fallback for target={}", target);
    deterministic_fallback(task, target, trajectory)
}

async fn translate_with_llm(
    ctx: &RunContext,
    llm: &LlmClient,
    task: &str,
    target: AgentTarget,
    trajectory: &str,
) -> std::result::Result<Value, String> {
    let user_content = format!(
        "Task: {}\nAgent type: {}\nTrajectory (markdown follows):\n```markdown\n{}\n```\n\
         Instruction: Translate the trajectory markdown into the canonical JSON format. \
         Extract all data from the markdown - there are no other inputs. \
         Return ONLY valid JSON with all required fields.",
        task, target, trajectory
    );
    let request = LlmRequest {
        model: llm.default_model().to_string(),
        messages: vec![
            Message::system(TRANSLATOR_SYSTEM_PROMPT),
            Message::user(user_content),
        ],
        options: GenerationOptions {
            json_mode: true,
            max_output_tokens: Some(TRANSLATOR_MAX_OUTPUT_TOKENS),
            reasoning_effort: Some(ReasoningEffort::Medium),
            ..Default::default()
        },
    };

    let response = llm
        .generate(ctx, "translator.llm", request)
        .await
        .map_err(|e| e.to_string())?;

    let parsed = parse_json_lenient(&response.text).ok_or("invalid JSON")?;
    let missing: Vec<&&str> = REQUIRED_FIELDS
        .iter()
        .filter(|field| parsed.get(**field).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required fields: {:?}", missing));
    }
    Ok(parsed)
}

/// Parse JSON, stripping markdown code fences if present.
fn parse_json_lenient(text: &str) -> Option<Value> {
    let mut text = text.trim();
    if text.starts_with("```") {
        let mut lines: Vec<&str> = text.lines().collect();
        if !lines.is_empty() {
            lines.remove(0);
        }
        if lines.last().map(|l| l.trim() == "```").unwrap_or(false) {
            lines.pop();
        }
        return serde_json::from_str(&lines.join("\n")).ok();
    }
    // Tolerate stray prose around a single JSON object.
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&text[start..=end]) {
                return Some(value);
            }
        }
    }
    text = text.trim();
    serde_json::from_str(text).ok()
}

fn step_header_re(target: AgentTarget) -> &'static Regex {
    static MCP: OnceLock<Regex> = OnceLock::new();
    static COMPUTER: OnceLock<Regex> = OnceLock::new();
    match target {
        AgentTarget::Mcp => MCP.get_or_init(|| {
            Regex::new(r"(?m)^#{1,3}\s+Step\s+(\d+)").expect("valid regex")
        }),
        AgentTarget::ComputerUse => COMPUTER.get_or_init(|| {
            Regex::new(r"(?m)^##\s+Step\s+(\d+)").expect("valid regex")
        }),
    }
}

/// Deterministic parser used when the LLM path is unavailable.
///
/// Loses artifact detail but always produces a schema-complete document, so
/// translating the same trajectory twice yields byte-identical JSON.
pub fn deterministic_fallback(task: &str, target: AgentTarget, trajectory: &str) -> Value {
    let header_re = step_header_re(target);
    let step_numbers: Vec<u64> = header_re
        .captures_iter(trajectory)
        .filter_map(|c| c[1].parse().ok())
        .collect();
    let total_steps = step_numbers.len() as u64;

    static ERROR_RE: OnceLock<Regex> = OnceLock::new();
    let error_re =
        ERROR_RE.get_or_init(|| Regex::new(r"\*\*Error\*\*:\s*(.+?)(?:\n|$)").expect("valid regex"));
    let error = error_re
        .captures(trajectory)
        .map(|c| c[1].trim().to_string());

    static STATUS_RE: OnceLock<Regex> = OnceLock::new();
    let status_re =
        STATUS_RE.get_or_init(|| Regex::new(r"\*\*Status\*\*:\s*(\w+)").expect("valid regex"));
    static COMPLETION_RE: OnceLock<Regex> = OnceLock::new();
    let completion_re = COMPLETION_RE
        .get_or_init(|| Regex::new(r"\*\*Completion Reason\*\*:\s*(\w+)").expect("valid regex"));

    let status = status_re
        .captures(trajectory)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let completion = completion_re
        .captures(trajectory)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let has_completion_step = trajectory.contains(": Completion");
    let overall_success = (status == "success"
        || status == "completed"
        || completion == "DONE"
        || has_completion_step)
        && error.is_none();
    let last_step_failed = error.is_some() || status == "failed" || completion == "FAIL";

    // One summary line per step: first few content lines under each header.
    let mut steps_summary: Vec<String> = Vec::new();
    let mut current_step: Option<u64> = None;
    let mut current_lines: Vec<String> = Vec::new();
    static MARKUP_RE: OnceLock<Regex> = OnceLock::new();
    let markup_re =
        MARKUP_RE.get_or_init(|| Regex::new(r"\*\*|```|###").expect("valid regex"));

    let flush = |step: Option<u64>, lines: &mut Vec<String>, out: &mut Vec<String>| {
        if let Some(number) = step {
            if !lines.is_empty() {
                out.push(format!("Step {}: {}", number, lines[..lines.len().min(3)].join(" ")));
            }
        }
        lines.clear();
    };

    for line in trajectory.lines() {
        if let Some(captures) = header_re.captures(line) {
            flush(current_step, &mut current_lines, &mut steps_summary);
            current_step = captures[1].parse().ok();
        } else if current_step.is_some() && !line.trim().is_empty() {
            let clean = markup_re.replace_all(line, "").trim().to_string();
            if !clean.is_empty() {
                current_lines.push(clean);
            }
        }
    }
    flush(current_step, &mut current_lines, &mut steps_summary);

    if steps_summary.is_empty() {
        steps_summary.push("Step execution summary unavailable".to_string());
    }

    json!({
        "task": task,
        "overall_success": overall_success,
        "summary": format!(
            "Executed {} step(s). {}",
            total_steps,
            if overall_success {
                "Task completed.".to_string()
            } else {
                format!("Failed: {}", error.as_deref().unwrap_or("Unknown error"))
            }
        ),
        "error": error,
        "error_code": if overall_success { Value::Null } else { json!("execution_failed") },
        "last_step_failed": last_step_failed,
        "failed_step_index": if !overall_success && !step_numbers.is_empty() {
            json!(step_numbers[step_numbers.len() - 1])
        } else {
            Value::Null
        },
        "total_steps": total_steps,
        "steps_summary": steps_summary,
        "artifacts": {
            "tool_calls": [],
            "ui_observations": [],
            "code_executions": [],
            "search_results": [],
        },
    })
}
