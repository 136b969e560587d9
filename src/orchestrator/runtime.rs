//! Orchestrator runtime: the outer loop.
//!
//! Owns run identity and concurrency, asks the LLM for one atomic step at a
//! time, dispatches to a sub-agent bridge, translates the returned trajectory,
//! and re-plans until the task is complete, impossible, or out of budget.
//! The orchestrator never inspects raw sub-agent output - only translated
//! canonical JSON.

use chrono::Utc;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::ToolIndex;
use crate::config::Config;
use crate::context::RunContext;
use crate::cost::{CostSnapshot, TokenCostTracker};
use crate::dispatch::ToolDispatcher;
use crate::error::{Error, Result};
use crate::llm::{GenerationOptions, LlmClient, LlmRequest, LlmRequestRegistry, Message, ReasoningEffort};
use crate::logging::RunLogger;
use crate::orchestrator::bridge::{McpBridge, StubComputerUseBridge, SubAgentBridge};
use crate::orchestrator::capabilities::build_capability_context;
use crate::orchestrator::prompt::build_system_prompt;
use crate::orchestrator::translator::translate_step_output;
use crate::orchestrator::types::{
    generate_step_id, AgentTarget, OrchestratorRequest, PlannedStep, RunState, StepResult,
    StepStatus,
};
use crate::signal::SignalBus;
use crate::stream::StreamBus;

/// Output ceiling for decision calls
const DECISION_MAX_OUTPUT_TOKENS: u32 = 3_000;

/// One orchestrator decision.
#[derive(Debug, Clone, PartialEq)]
enum Decision {
    NextStep {
        target: AgentTarget,
        task: String,
        reasoning: String,
    },
    TaskComplete {
        reasoning: String,
    },
    TaskImpossible {
        reasoning: String,
    },
}

/// Entry point for coordinating work between agents.
///
/// Cost accounting is per run: each accepted request gets a fresh
/// `TokenCostTracker` so concurrent runs never trip each other's budgets.
pub struct OrchestratorRuntime {
    llm: Arc<LlmClient>,
    index: Arc<ToolIndex>,
    mcp_bridge: Arc<dyn SubAgentBridge>,
    computer_use_bridge: Arc<dyn SubAgentBridge>,
    signals: Arc<SignalBus>,
    stream: Arc<StreamBus>,
    llm_requests: Arc<LlmRequestRegistry>,
    semaphore: Arc<Semaphore>,
    logs_dir: PathBuf,
    translator_llm: bool,
}

impl OrchestratorRuntime {
    /// Create a runtime with the in-process MCP bridge and a stub
    /// computer-use bridge.
    pub fn new(
        config: &Config,
        llm: Arc<LlmClient>,
        index: Arc<ToolIndex>,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> Self {
        let mcp_bridge = Arc::new(McpBridge::new(
            Arc::clone(&llm),
            Arc::clone(&index),
            Arc::clone(&dispatcher),
            config.sandbox.clone(),
        ));
        OrchestratorRuntime {
            llm,
            index,
            mcp_bridge,
            computer_use_bridge: Arc::new(StubComputerUseBridge),
            signals: SignalBus::new(),
            stream: Arc::new(StreamBus::new()),
            llm_requests: Arc::new(LlmRequestRegistry::new()),
            semaphore: Arc::new(Semaphore::new(config.runtime.max_concurrency)),
            logs_dir: config.runtime.logs_dir.clone(),
            translator_llm: true,
        }
    }

    /// Replace the computer-use bridge
    pub fn with_computer_use_bridge(mut self, bridge: Arc<dyn SubAgentBridge>) -> Self {
        self.computer_use_bridge = bridge;
        self
    }

    /// Replace the MCP bridge (tests use scripted bridges)
    pub fn with_mcp_bridge(mut self, bridge: Arc<dyn SubAgentBridge>) -> Self {
        self.mcp_bridge = bridge;
        self
    }

    /// Enable/disable the translator's LLM path (disabled = deterministic only)
    pub fn with_translator_llm(mut self, enabled: bool) -> Self {
        self.translator_llm = enabled;
        self
    }

    /// Signal bus shared with operators
    pub fn signals(&self) -> Arc<SignalBus> {
        Arc::clone(&self.signals)
    }

    /// Stream bus for event subscribers
    pub fn stream(&self) -> Arc<StreamBus> {
        Arc::clone(&self.stream)
    }

    /// In-flight LLM request registry (operator cancel/retry)
    pub fn llm_requests(&self) -> Arc<LlmRequestRegistry> {
        Arc::clone(&self.llm_requests)
    }

    /// Process a single request with single-step planning.
    pub async fn run(&self, request: OrchestratorRequest) -> Result<RunState> {
        self.validate_request(&request)?;
        self.signals.clear();

        let run_logger = RunLogger::create(&self.logs_dir, &request.task)?;
        // Fresh tracker per run: budget checks and usage deltas must only
        // ever see this run's own spending.
        let cost = Arc::new(TokenCostTracker::new());
        let ctx = RunContext {
            run_id: request.request_id(),
            task_id: format!("task-{}", &Uuid::new_v4().simple().to_string()[..10]),
            tenant_id: request.tenant.as_ref().map(|t| t.tenant_id.clone()),
            request_id: request.request_id(),
            user_id: request.resolved_user_id(),
            signals: Arc::clone(&self.signals),
            stream: Arc::clone(&self.stream),
            cost: Arc::clone(&cost),
            delegation_cost: None,
            llm_requests: Arc::clone(&self.llm_requests),
            run_logger: Arc::clone(&run_logger),
            logger: run_logger.agent("orchestrator"),
        };

        let tenant_id = ctx.tenant_id.clone().unwrap_or_else(|| "unknown".into());
        info!(
            "Starting orchestration request_id={} tenant={}",
            ctx.request_id, tenant_id
        );

        let mut state = RunState::new(request, cost.total_cost_usd());
        ctx.emit(
            "orchestrator.task.started",
            json!({
                "request_id": ctx.request_id,
                "tenant_id": tenant_id,
                "task": state.request.task.chars().take(100).collect::<String>(),
                "max_steps": state.request.budget.max_steps,
                "tool_constraints": state.request.tool_constraints,
            }),
        );

        while state.within_limits(ctx.cost.total_cost_usd()) {
            if self.observe_signals(&ctx, &mut state).await {
                break;
            }

            let last_failed_step = state
                .results
                .last()
                .filter(|result| result.status == StepStatus::Failed)
                .cloned();

            let decision = self
                .decide_next_step(&ctx, &state, last_failed_step.as_ref())
                .await;
            let decision_type = match &decision {
                Decision::NextStep { .. } => "next_step",
                Decision::TaskComplete { .. } => "task_complete",
                Decision::TaskImpossible { .. } => "task_impossible",
            };
            ctx.emit(
                "orchestrator.planning.completed",
                json!({"decision_type": decision_type}),
            );

            match decision {
                Decision::TaskComplete { reasoning } => {
                    info!("Task complete: {}", reasoning);
                    ctx.logger
                        .log_event("task.complete", json!({"reasoning": reasoning}));
                    state.record_intermediate("completion_status", json!("complete"));
                    break;
                }
                Decision::TaskImpossible { reasoning } => {
                    info!("Task impossible: {}", reasoning);
                    ctx.logger
                        .log_event("task.impossible", json!({"reasoning": reasoning}));
                    state.record_intermediate("completion_status", json!("impossible"));
                    state.record_intermediate("impossible_reason", json!(reasoning));
                    break;
                }
                Decision::NextStep {
                    target,
                    task,
                    reasoning,
                } => {
                    let remaining_steps = state
                        .request
                        .budget
                        .max_steps
                        .saturating_sub(state.total_steps() as u32)
                        .max(1);
                    let step = PlannedStep {
                        step_id: generate_step_id(&format!("step-{}", state.total_steps())),
                        target,
                        next_task: task.clone(),
                        verification: "Step completed".to_string(),
                        max_steps: remaining_steps.min(10),
                        description: Some(task.chars().take(100).collect()),
                        hints: Default::default(),
                    };
                    state.plan.push(step.clone());
                    info!(
                        "Next step: {} - {} ({})",
                        target,
                        task.chars().take(80).collect::<String>(),
                        reasoning.chars().take(120).collect::<String>()
                    );

                    ctx.emit(
                        "orchestrator.step.dispatching",
                        json!({
                            "step_id": step.step_id,
                            "target": step.target,
                            "task": step.next_task.chars().take(100).collect::<String>(),
                        }),
                    );

                    let result = self.dispatch_step(&ctx, &step, &mut state).await;
                    let cancelled = result.status == StepStatus::Cancelled;
                    ctx.emit(
                        "orchestrator.step.completed",
                        json!({
                            "step_id": result.step_id,
                            "status": result.status,
                            "success": result.success,
                        }),
                    );
                    state.record_result(result);
                    if cancelled {
                        state.record_intermediate("completion_status", json!("cancelled"));
                        break;
                    }
                }
            }

            if state.cost_exceeded(ctx.cost.total_cost_usd()) {
                info!("Budget exceeded; stopping.");
                state.record_intermediate("completion_status", json!("budget_exceeded"));
                break;
            }
            if state.total_steps() as u32 >= state.request.budget.max_steps {
                info!(
                    "Step limit reached ({}); stopping.",
                    state.request.budget.max_steps
                );
                state.record_intermediate("completion_status", json!("max_steps"));
                break;
            }
        }

        ctx.emit(
            "orchestrator.task.completed",
            json!({
                "total_steps": state.total_steps(),
                "status": if state.all_succeeded() { "success" } else { "partial" },
            }),
        );
        ctx.logger.log_event(
            "task.completed",
            json!({
                "total_steps": state.total_steps(),
                "successful_steps": state.results.iter().filter(|r| r.success).count(),
                "failed_steps": state.results.iter().filter(|r| !r.success).count(),
            }),
        );
        self.stream.close(&ctx.run_id);

        Ok(state)
    }

    /// Run many requests concurrently while honoring the semaphore.
    pub async fn run_many(
        &self,
        requests: Vec<OrchestratorRequest>,
    ) -> Vec<Result<RunState>> {
        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            let permit = Arc::clone(&self.semaphore);
            handles.push(async move {
                let _permit = permit
                    .acquire()
                    .await
                    .map_err(|_| Error::Internal("runtime semaphore closed".into()))?;
                self.run(request).await
            });
        }
        futures::future::join_all(handles).await
    }

    /// Reject user-input errors at the boundary before a run starts.
    fn validate_request(&self, request: &OrchestratorRequest) -> Result<()> {
        if request.task.trim().is_empty() {
            return Err(Error::InvalidInput("task must be a non-empty string".into()));
        }
        if let Some(ref constraints) = request.tool_constraints {
            let unknown = self.index.unknown_providers(&constraints.providers);
            if !unknown.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "tool_constraints name unknown providers: {}",
                    unknown.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Observe pause/cancel; returns true when the run must stop.
    async fn observe_signals(&self, ctx: &RunContext, state: &mut RunState) -> bool {
        if let Err(e) = ctx.signals.raise_if_exit_requested() {
            warn!("Run cancelled before next step: {}", e);
            state.record_intermediate("completion_status", json!("cancelled"));
            return true;
        }
        if let Err(e) = ctx.signals.wait_for_resume().await {
            warn!("Run cancelled while paused: {}", e);
            state.record_intermediate("completion_status", json!("cancelled"));
            return true;
        }
        false
    }

    /// Ask the orchestrator LLM what the next step should be.
    ///
    /// Retries once on invalid output or transient failure; a second failure
    /// degrades to `task_impossible`.
    async fn decide_next_step(
        &self,
        ctx: &RunContext,
        state: &RunState,
        last_failed: Option<&StepResult>,
    ) -> Decision {
        let capabilities = build_capability_context(&self.index, &state.request);
        let system_prompt =
            build_system_prompt(&state.request, &capabilities, &state.results, last_failed);

        let request = LlmRequest {
            model: self.llm.default_model().to_string(),
            messages: vec![
                Message::system(system_prompt),
                Message::user("What should be the next step to accomplish this goal?"),
            ],
            options: GenerationOptions {
                json_mode: true,
                max_output_tokens: Some(DECISION_MAX_OUTPUT_TOKENS),
                reasoning_effort: Some(ReasoningEffort::High),
                ..Default::default()
            },
        };

        let mut last_error = String::new();
        for attempt in 0..2 {
            let response = match self
                .llm
                .generate(ctx, "orchestrator.decide", request.clone())
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    last_error = e.to_string();
                    warn!("Orchestrator LLM failed (attempt {}): {}", attempt + 1, e);
                    continue;
                }
            };
            match parse_decision(&response.text) {
                Ok(decision) => return decision,
                Err(e) => {
                    last_error = e;
                    warn!(
                        "Orchestrator LLM returned invalid decision (attempt {}): {}",
                        attempt + 1,
                        last_error
                    );
                }
            }
        }

        error!("Orchestrator planning failed: {}", last_error);
        Decision::TaskImpossible {
            reasoning: format!("Orchestrator planning failed: {}", last_error),
        }
    }

    /// Dispatch a step to the requested agent and translate its trajectory.
    async fn dispatch_step(
        &self,
        ctx: &RunContext,
        step: &PlannedStep,
        state: &mut RunState,
    ) -> StepResult {
        let started_at = Utc::now();
        state.record_intermediate("last_target", json!(step.target));
        state.record_intermediate("last_step_id", json!(step.step_id));
        info!(
            "Dispatching step_id={} target={} task={}",
            step.step_id,
            step.target,
            step.next_task.chars().take(80).collect::<String>()
        );

        let cost_snapshot = ctx.cost.snapshot();
        let bridge = match step.target {
            AgentTarget::Mcp => &self.mcp_bridge,
            AgentTarget::ComputerUse => &self.computer_use_bridge,
        };

        let outcome = bridge.run(ctx, &state.request, step).await;
        self.finish_step(ctx, step, state, outcome, cost_snapshot, started_at)
            .await
    }

    async fn finish_step(
        &self,
        ctx: &RunContext,
        step: &PlannedStep,
        state: &RunState,
        outcome: Result<(Value, String)>,
        cost_snapshot: CostSnapshot,
        started_at: chrono::DateTime<Utc>,
    ) -> StepResult {
        match outcome {
            Ok((_raw, trajectory)) => {
                let translator_ctx = ctx.child("translator");
                let llm = if self.translator_llm {
                    Some(self.llm.as_ref())
                } else {
                    None
                };
                let translated = translate_step_output(
                    &translator_ctx,
                    llm,
                    &step.next_task,
                    step.target,
                    &trajectory,
                )
                .await;

                let overall_success = translated
                    .get("overall_success")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let error = translated
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let usage = ctx.cost.usage_since(&cost_snapshot);
                let payload = json!({
                    "target": step.target,
                    "run": {
                        "tenant_id": state.request.tenant.as_ref().map(|t| t.tenant_id.clone()),
                        "request_id": state.request.request_id(),
                        "user_id": state.request.resolved_user_id(),
                    },
                    "translated": translated,
                    "raw_ref": format!("{}:raw", step.step_id),
                    "usage": usage,
                });

                StepResult {
                    step_id: step.step_id.clone(),
                    target: step.target,
                    next_task: step.next_task.clone(),
                    status: if overall_success {
                        StepStatus::Completed
                    } else {
                        StepStatus::Failed
                    },
                    success: overall_success,
                    output: payload,
                    error,
                    started_at,
                    finished_at: Utc::now(),
                }
            }
            Err(e) => {
                let cancelled = e.is_cancelled();
                let payload = json!({
                    "target": step.target,
                    "error": e.to_string(),
                    "usage": ctx.cost.usage_since(&cost_snapshot),
                    "raw_ref": format!("{}:raw", step.step_id),
                });
                StepResult {
                    step_id: step.step_id.clone(),
                    target: step.target,
                    next_task: step.next_task.clone(),
                    status: if cancelled {
                        StepStatus::Cancelled
                    } else {
                        StepStatus::Failed
                    },
                    success: false,
                    output: payload,
                    error: Some(e.to_string()),
                    started_at,
                    finished_at: Utc::now(),
                }
            }
        }
    }
}

/// Parse an orchestrator decision from assistant text.
fn parse_decision(text: &str) -> std::result::Result<Decision, String> {
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|e| format!("invalid JSON: {}", e))?;
    let decision_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or("missing 'type'")?;
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    match decision_type {
        "task_complete" => Ok(Decision::TaskComplete { reasoning }),
        "task_impossible" => Ok(Decision::TaskImpossible { reasoning }),
        "next_step" => {
            let target = match value.get("target").and_then(Value::as_str) {
                Some("mcp") => AgentTarget::Mcp,
                Some("computer_use") => AgentTarget::ComputerUse,
                other => return Err(format!("invalid target: {:?}", other)),
            };
            let task = value
                .get("task")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or("next_step requires a non-empty 'task'")?
                .to_string();
            Ok(Decision::NextStep {
                target,
                task,
                reasoning,
            })
        }
        other => Err(format!("invalid response type: {}", other)),
    }
}
