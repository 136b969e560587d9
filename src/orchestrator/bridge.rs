//! Sub-agent bridges.
//!
//! Bridges run a delegated step on a sub-agent and return
//! `(raw_result, trajectory_markdown)`. The orchestrator consumes only the
//! trajectory; raw results are logged and discarded. Bridges are resilient:
//! any failure becomes a stub result with an empty trajectory instead of
//! crashing the outer loop.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;

use crate::catalog::ToolIndex;
use crate::config::SandboxConfig;
use crate::context::RunContext;
use crate::dispatch::ToolDispatcher;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::orchestrator::types::{OrchestratorRequest, PlannedStep};
use crate::planner::{execute_mcp_task, Budget, PlannerDeps};

/// Capability to run one delegated step on a sub-agent.
#[async_trait]
pub trait SubAgentBridge: Send + Sync {
    /// Execute the step; returns `(raw_result, trajectory_markdown)`
    async fn run(
        &self,
        ctx: &RunContext,
        request: &OrchestratorRequest,
        step: &PlannedStep,
    ) -> Result<(Value, String)>;
}

/// Bridge into the in-process MCP planner.
pub struct McpBridge {
    llm: Arc<LlmClient>,
    index: Arc<ToolIndex>,
    dispatcher: Arc<dyn ToolDispatcher>,
    sandbox_config: SandboxConfig,
}

impl McpBridge {
    /// Create a bridge over the run's shared pieces
    pub fn new(
        llm: Arc<LlmClient>,
        index: Arc<ToolIndex>,
        dispatcher: Arc<dyn ToolDispatcher>,
        sandbox_config: SandboxConfig,
    ) -> Self {
        McpBridge {
            llm,
            index,
            dispatcher,
            sandbox_config,
        }
    }
}

#[async_trait]
impl SubAgentBridge for McpBridge {
    async fn run(
        &self,
        ctx: &RunContext,
        request: &OrchestratorRequest,
        step: &PlannedStep,
    ) -> Result<(Value, String)> {
        let planner_ctx = ctx.child("planner");

        let mut extra_context = Map::new();
        extra_context.insert("request_id".into(), json!(request.request_id()));
        extra_context.insert("orchestrator_task".into(), json!(request.task));

        let budget = Budget {
            max_steps: step.max_steps,
            ..Budget::default()
        };

        let deps = PlannerDeps {
            llm: &self.llm,
            index: &self.index,
            dispatcher: Arc::clone(&self.dispatcher),
            sandbox_config: &self.sandbox_config,
            tool_constraints: request.tool_constraints.as_ref(),
        };

        match execute_mcp_task(&planner_ctx, deps, &step.next_task, budget, extra_context).await {
            Ok(result) => {
                let trajectory = result.trajectory_md.clone();
                Ok((result.to_value(), trajectory))
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                // Keep the outer loop alive on bridge failure.
                warn!("MCP bridge fell back to stub output: {}", e);
                planner_ctx.logger.log_event(
                    "bridge.mcp.stub",
                    json!({"error": e.to_string(), "step_id": step.step_id}),
                );
                let stub = json!({
                    "success": true,
                    "final_summary": "MCP agent stubbed output.",
                    "error": null,
                    "steps": [],
                    "logs": [],
                });
                Ok((stub, String::new()))
            }
        }
    }
}

/// Default computer-use bridge for deployments without a desktop worker.
///
/// Returns a trajectory that the translator reads as a failed step, so the
/// orchestrator learns the capability is missing instead of hanging.
pub struct StubComputerUseBridge;

#[async_trait]
impl SubAgentBridge for StubComputerUseBridge {
    async fn run(
        &self,
        ctx: &RunContext,
        _request: &OrchestratorRequest,
        step: &PlannedStep,
    ) -> Result<(Value, String)> {
        ctx.logger.log_event(
            "bridge.computer_use.stub",
            json!({"step_id": step.step_id, "task": step.next_task}),
        );
        let raw = json!({
            "task": step.next_task,
            "status": "failed",
            "completion_reason": "FAIL",
            "steps": [],
            "error": "Computer-use agent is not configured in this deployment.",
        });
        let trajectory = format!(
            "## Step 1\n\n### Worker Agent\n**Plan**: {}\n**Error**: Computer-use agent is not configured in this deployment.\n\n## Final Status\n**Status**: failed\n**Completion Reason**: FAIL\n",
            step.next_task
        );
        Ok((raw, trajectory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::{generate_step_id, AgentTarget};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_stub_computer_use_bridge_reports_failure() {
        let dir = tempdir().unwrap();
        let ctx = crate::context::testing::test_context(dir.path());
        let request = OrchestratorRequest::from_task("tenant", "open the file");
        let step = PlannedStep {
            step_id: generate_step_id("step"),
            target: AgentTarget::ComputerUse,
            next_task: "open the file".into(),
            verification: "file open".into(),
            max_steps: 5,
            description: None,
            hints: Map::new(),
        };

        let (raw, trajectory) = StubComputerUseBridge
            .run(&ctx, &request, &step)
            .await
            .unwrap();
        assert_eq!(raw["status"], "failed");
        assert!(trajectory.contains("**Status**: failed"));
    }
}
