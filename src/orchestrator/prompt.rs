//! Dynamic system prompt for the orchestrator.
//!
//! Every decision call gets a freshly built prompt: a static foundation
//! describing the two sub-agents and the decision framework, a capability
//! section, a context section enumerating previous step results with their
//! full translated JSON, and a failure reminder when the last step failed.

use serde_json::Value;

use crate::orchestrator::capabilities::CapabilityContext;
use crate::orchestrator::types::{OrchestratorRequest, StepResult};

/// Active windows shown in the capability section
const MAX_WINDOWS: usize = 10;

/// Static foundation: role, agents, decision framework, output format.
pub const STATIC_FOUNDATION: &str = r#"You are the Orchestrator Agent - a meta-agent that decides the next atomic step to accomplish a user's task.

## Your Role

You analyze the user's goal, review what has been accomplished so far, and decide the single next step to execute. After each step completes, you will be called again to decide the next action.

## Available Agents

### MCP Agent
Use for API-accessible operations: email, messaging, CRM, database queries, file storage - anything reachable through an OAuth-connected provider tool. Returns structured API responses and confirmations. Fast and precise, but cannot touch UI or desktop applications.

Formulate MCP tasks specifically so the agent discovers the right tools quickly:
- GOOD: "Use Gmail provider's gmail_search tool to find emails from john@example.com in the last 7 days"
- BAD: "Search for emails" (which provider? what criteria?)
Template: "Use [provider] provider's [probable_tool] tool to [specific action with parameters]"

### Computer-Use Agent
Use for desktop application automation, UI interactions requiring visual grounding, and multi-application desktop workflows. Actions include click, type, scroll, drag_and_drop, hotkey, open, switch_applications, wait. Returns UI action descriptions and visual observations. Slower and less robust than MCP.

Formulate Computer-Use tasks with concrete UI detail:
- GOOD: "In Chrome, click the 'Download Invoice' button in the top-right, then wait 5 seconds for the download"
- BAD: "Download the invoice"

## Decision Framework

1. If the step can be done via an available API provider, use MCP.
2. If the step requires desktop UI interaction, use Computer-Use.
3. If unsure which provider can help, use MCP first to search and explore.
4. Hybrid flows are normal: retrieve with MCP, manipulate on the desktop with Computer-Use, or vice versa. Data from previous steps (paths, ids, values) appears in their translated results - carry it forward verbatim.

## Your Output Format

Respond with JSON in exactly ONE of these three formats:

{"type": "next_step", "target": "mcp" | "computer_use", "task": "clear, specific description", "reasoning": "why this is the right next step"}

{"type": "task_complete", "reasoning": "how the user's goal has been fully accomplished"}

{"type": "task_impossible", "reasoning": "why the task cannot be completed"}

Guidelines:
- Output exactly one of the three response types, as a bare JSON object.
- Use task_impossible if you detect a loop (same action failing repeatedly) or required capabilities are missing.
- Use task_complete only when the original user goal is fully satisfied."#;

/// Build the full system prompt for one decision.
pub fn build_system_prompt(
    request: &OrchestratorRequest,
    capabilities: &CapabilityContext,
    results: &[StepResult],
    failed_step: Option<&StepResult>,
) -> String {
    let mut sections = vec![STATIC_FOUNDATION.to_string()];
    sections.push(format_capability_section(capabilities));
    sections.push(format_context_section(&request.task, results));
    if let Some(hints) = format_plan_hints(request) {
        sections.push(hints);
    }
    if let Some(failed) = failed_step {
        sections.push(format_failure_reminder(failed));
    }
    sections.join("\n")
}

/// Optional hints: a pre-composed plan and preferred agents, when provided.
fn format_plan_hints(request: &OrchestratorRequest) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();
    if let Some(ref agents) = request.preferred_agents {
        if !agents.is_empty() {
            let names: Vec<String> = agents.iter().map(|a| a.to_string()).collect();
            lines.push(format!(
                "**Preferred agents (in order):** {}",
                names.join(", ")
            ));
        }
    }
    if let Some(ref plan) = request.composed_plan {
        let rendered =
            serde_json::to_string_pretty(plan).unwrap_or_else(|_| plan.to_string());
        lines.push(format!(
            "**Pre-composed plan (advisory, adapt as results come in):**\n```json\n{}\n```",
            rendered
        ));
    }
    if lines.is_empty() {
        return None;
    }
    Some(format!("\n## Planning Hints\n\n{}\n", lines.join("\n\n")))
}

fn format_capability_section(capabilities: &CapabilityContext) -> String {
    let providers = if capabilities.providers.is_empty() {
        "No MCP providers authorized. User needs to connect OAuth accounts.".to_string()
    } else {
        capabilities
            .providers
            .iter()
            .map(|p| format!("- **{}**: {} tools available", p.provider, p.tools.len()))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let apps = if capabilities.desktop.available_apps.is_empty() {
        "No applications detected".to_string()
    } else {
        capabilities.desktop.available_apps.join(", ")
    };

    let windows = if capabilities.desktop.active_windows.is_empty() {
        "No active windows".to_string()
    } else {
        let mut lines: Vec<String> = capabilities
            .desktop
            .active_windows
            .iter()
            .take(MAX_WINDOWS)
            .map(|w| format!("  - {}: \"{}\"", w.app_name, w.title))
            .collect();
        let extra = capabilities.desktop.active_windows.len().saturating_sub(MAX_WINDOWS);
        if extra > 0 {
            lines.push(format!("  ... ({} more windows)", extra));
        }
        lines.join("\n")
    };

    format!(
        "\n## Current Capabilities\n\n\
         ### MCP Providers (API/Tool-based automation)\n{}\n\n\
         ### Desktop Environment (UI automation)\n\
         **Platform:** {}\n\
         **Available Applications:** {}\n\
         **Active Windows:**\n{}\n",
        providers, capabilities.desktop.platform, apps, windows
    )
}

fn format_context_section(task: &str, results: &[StepResult]) -> String {
    format!(
        "\n## Current Task\n\n**User's Goal:** {}\n\n**Steps Completed So Far:**\n{}\n",
        task,
        format_previous_results(results)
    )
}

/// Render previous step results, each with its full translated JSON.
pub fn format_previous_results(results: &[StepResult]) -> String {
    if results.is_empty() {
        return "None - this is the first step.".to_string();
    }

    let mut blocks: Vec<String> = Vec::new();
    for (i, result) in results.iter().enumerate() {
        let status_icon = if result.success { "[ok]" } else { "[failed]" };
        let translated = result.translated().cloned().unwrap_or(Value::Null);
        let summary = translated
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("No summary");

        let mut block = format!(
            "{}. {} {}: {}\n   Result: {}",
            i + 1,
            status_icon,
            result.target.to_string().to_uppercase(),
            result.next_task,
            summary
        );

        if !translated.is_null() {
            let rendered = serde_json::to_string_pretty(&translated)
                .unwrap_or_else(|_| translated.to_string());
            let indented = rendered
                .lines()
                .map(|line| format!("     {}", line))
                .collect::<Vec<_>>()
                .join("\n");
            block.push_str(&format!("\n   Translated data:\n{}", indented));
        } else if let Some(ref error) = result.error {
            block.push_str(&format!("\n   Error: {}", error));
        }

        blocks.push(block);
    }
    blocks.join("\n\n")
}

fn format_failure_reminder(failed: &StepResult) -> String {
    format!(
        "\n## Previous Step Failed\n\n\
         **Last Action:** {} (via {} agent)\n\
         **Error:** {}\n\n\
         **What to do next:**\n\
         - Analyze if this failure blocks the entire task or if there's an alternative approach\n\
         - If you can work around it, output the next step to try (different approach, different agent)\n\
         - If this failure makes the task impossible, output `task_impossible` with clear reasoning\n\
         - If you've seen this same error multiple times, the task is likely impossible\n",
        failed.next_task,
        failed.target,
        failed.error.as_deref().unwrap_or("Unknown error"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::capabilities::DesktopEnvironment;
    use crate::orchestrator::types::{AgentTarget, StepStatus};
    use chrono::Utc;
    use serde_json::json;

    fn capabilities() -> CapabilityContext {
        CapabilityContext {
            providers: vec![crate::catalog::ProviderTools {
                provider: "gmail".into(),
                tools: vec!["gmail_search".into(), "gmail_send_email".into()],
            }],
            desktop: DesktopEnvironment {
                platform: "linux".into(),
                available_apps: vec!["Chrome".into()],
                active_windows: vec![],
            },
        }
    }

    fn result(success: bool, translated: Value) -> StepResult {
        StepResult {
            step_id: "step-1".into(),
            target: AgentTarget::Mcp,
            next_task: "fetch the attachment".into(),
            status: if success { StepStatus::Completed } else { StepStatus::Failed },
            success,
            output: json!({"translated": translated}),
            error: if success { None } else { Some("boom".into()) },
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_prompt_contains_sections() {
        let request = OrchestratorRequest::from_task("tenant", "organize my inbox");
        let prompt = build_system_prompt(&request, &capabilities(), &[], None);
        assert!(prompt.contains("## Your Role"));
        assert!(prompt.contains("**gmail**: 2 tools available"));
        assert!(prompt.contains("**User's Goal:** organize my inbox"));
        assert!(prompt.contains("None - this is the first step."));
        assert!(!prompt.contains("Previous Step Failed"));
    }

    #[test]
    fn test_prompt_renders_translated_json_verbatim() {
        let request = OrchestratorRequest::from_task("tenant", "task");
        let translated = json!({
            "summary": "Downloaded the report",
            "overall_success": true,
            "data": {"path": "/home/user/Downloads/report.pdf"},
        });
        let results = vec![result(true, translated)];
        let prompt = build_system_prompt(&request, &capabilities(), &results, None);
        // Data from the translated JSON is available verbatim to the next step.
        assert!(prompt.contains("/home/user/Downloads/report.pdf"));
        assert!(prompt.contains("Translated data:"));
    }

    #[test]
    fn test_prompt_plan_hints() {
        let mut request = OrchestratorRequest::from_task("tenant", "task");
        request.preferred_agents = Some(vec![AgentTarget::Mcp]);
        request.composed_plan = Some(json!({"steps": [{"target": "mcp", "task": "fetch"}]}));
        let prompt = build_system_prompt(&request, &capabilities(), &[], None);
        assert!(prompt.contains("## Planning Hints"));
        assert!(prompt.contains("Preferred agents (in order): mcp"));
        assert!(prompt.contains("Pre-composed plan"));
    }

    #[test]
    fn test_prompt_failure_reminder() {
        let request = OrchestratorRequest::from_task("tenant", "task");
        let failed = result(false, json!({"summary": "it broke"}));
        let results = vec![failed.clone()];
        let prompt = build_system_prompt(&request, &capabilities(), &results, Some(&failed));
        assert!(prompt.contains("## Previous Step Failed"));
        assert!(prompt.contains("**Error:** boom"));
    }
}
