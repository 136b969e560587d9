//! Canonical orchestrator data types.
//!
//! Single source of truth for the request/state/result shapes consumed by
//! the outer loop, so the agents plugging into the orchestrator cannot
//! drift apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Which sub-agent a step is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTarget {
    /// API tool execution via the MCP planner
    Mcp,
    /// GUI automation via the computer-use agent
    ComputerUse,
}

impl std::fmt::Display for AgentTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentTarget::Mcp => write!(f, "mcp"),
            AgentTarget::ComputerUse => write!(f, "computer_use"),
        }
    }
}

/// Lifecycle status of one dispatched step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Tool availability constraints for the MCP agent.
///
/// `auto` exposes every tool from authorized providers; `custom` restricts to
/// the allow-lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConstraints {
    /// Constraint mode
    pub mode: ConstraintMode,
    /// Allowed providers (custom mode)
    #[serde(default)]
    pub providers: Vec<String>,
    /// Allowed tool ids (custom mode); empty means all tools of allowed providers
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Constraint mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintMode {
    Auto,
    Custom,
}

impl Default for ToolConstraints {
    fn default() -> Self {
        ToolConstraints {
            mode: ConstraintMode::Auto,
            providers: Vec::new(),
            tools: Vec::new(),
        }
    }
}

impl ToolConstraints {
    /// Custom constraints restricted to the given allow-lists
    pub fn custom(providers: Vec<String>, tools: Vec<String>) -> Self {
        ToolConstraints {
            mode: ConstraintMode::Custom,
            providers,
            tools,
        }
    }

    /// Whether a provider/tool pair passes the constraints
    pub fn allows(&self, provider: &str, tool_id: &str) -> bool {
        match self.mode {
            ConstraintMode::Auto => true,
            ConstraintMode::Custom => {
                let provider_ok =
                    self.providers.is_empty() || self.providers.iter().any(|p| p == provider);
                let tool_ok = self.tools.is_empty() || self.tools.iter().any(|t| t == tool_id);
                provider_ok && tool_ok
            }
        }
    }
}

/// Controls how long a run is allowed to proceed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBudget {
    /// Maximum outer steps
    pub max_steps: u32,
    /// Maximum run cost in USD (None = unlimited)
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    /// Maximum tokens (None = unlimited)
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl Default for RunBudget {
    fn default() -> Self {
        RunBudget {
            max_steps: 15,
            max_cost_usd: None,
            max_tokens: None,
        }
    }
}

/// Multi-tenant context keeping runs isolated and auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantContext {
    /// Tenant owning the run
    pub tenant_id: String,
    /// Request correlation id
    pub request_id: String,
    /// Acting user
    #[serde(default)]
    pub user_id: Option<String>,
    /// Session id when present
    #[serde(default)]
    pub session_id: Option<String>,
    /// Free-form labels
    #[serde(default)]
    pub labels: Map<String, Value>,
}

/// Request accepted by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorRequest {
    /// Natural-language task
    pub task: String,
    /// Tenant context
    #[serde(default)]
    pub tenant: Option<TenantContext>,
    /// Run budget
    #[serde(default)]
    pub budget: RunBudget,
    /// Platform/controller metadata forwarded to sub-agents
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Whether sandboxed code execution is allowed
    #[serde(default)]
    pub allow_code_execution: bool,
    /// Tool constraints
    #[serde(default)]
    pub tool_constraints: Option<ToolConstraints>,
    /// Preferred agents, in order
    #[serde(default)]
    pub preferred_agents: Option<Vec<AgentTarget>>,
    /// Optional pre-composed plan hint
    #[serde(default)]
    pub composed_plan: Option<Value>,
    /// Request id override
    #[serde(default)]
    pub request_id: Option<String>,
    /// User id override
    #[serde(default)]
    pub user_id: Option<String>,
}

impl OrchestratorRequest {
    /// Helper for quick ad-hoc requests
    pub fn from_task(tenant_id: &str, task: &str) -> Self {
        let request_id = Uuid::new_v4().to_string();
        OrchestratorRequest {
            task: task.to_string(),
            tenant: Some(TenantContext {
                tenant_id: tenant_id.to_string(),
                request_id: request_id.clone(),
                user_id: None,
                session_id: None,
                labels: Map::new(),
            }),
            budget: RunBudget::default(),
            metadata: Map::new(),
            allow_code_execution: false,
            tool_constraints: None,
            preferred_agents: None,
            composed_plan: None,
            request_id: Some(request_id),
            user_id: None,
        }
    }

    /// Resolved request id
    pub fn request_id(&self) -> String {
        self.request_id
            .clone()
            .or_else(|| self.tenant.as_ref().map(|t| t.request_id.clone()))
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Resolved user id
    pub fn resolved_user_id(&self) -> String {
        self.user_id
            .clone()
            .or_else(|| self.tenant.as_ref().and_then(|t| t.user_id.clone()))
            .unwrap_or_else(|| "orchestrator".to_string())
    }
}

/// Generate a step id with a stable prefix
pub fn generate_step_id(prefix: &str) -> String {
    format!("{}-{}", prefix, &Uuid::new_v4().simple().to_string()[..8])
}

/// One atomic delegation decided by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    /// Step id
    pub step_id: String,
    /// Target sub-agent
    pub target: AgentTarget,
    /// Task delegated to the sub-agent
    pub next_task: String,
    /// How to verify completion
    pub verification: String,
    /// Inner-step budget for the delegation
    pub max_steps: u32,
    /// Short description for logs
    #[serde(default)]
    pub description: Option<String>,
    /// Optional hints for the sub-agent
    #[serde(default)]
    pub hints: Map<String, Value>,
}

/// Outcome of one delegated step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id mirroring the planned step
    pub step_id: String,
    /// Target agent that ran it
    pub target: AgentTarget,
    /// Delegated task
    pub next_task: String,
    /// Lifecycle status
    pub status: StepStatus,
    /// Success flag; defaults to `status == Completed`
    pub success: bool,
    /// Output payload; `output.translated` carries the canonical JSON
    pub output: Value,
    /// Error message on failure
    #[serde(default)]
    pub error: Option<String>,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
    /// Finish timestamp
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    /// Translated canonical JSON of this step, when present
    pub fn translated(&self) -> Option<&Value> {
        self.output.get("translated")
    }
}

/// Per-run state tracked inside the outer loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// The accepted request
    pub request: OrchestratorRequest,
    /// Steps planned so far (history)
    pub plan: Vec<PlannedStep>,
    /// Results recorded so far
    pub results: Vec<StepResult>,
    /// Scratch space for terminal markers and hints
    pub intermediate: Map<String, Value>,
    /// Process-wide cost total at run start
    pub cost_baseline: f64,
}

impl RunState {
    /// Create run state for a request
    pub fn new(request: OrchestratorRequest, cost_baseline: f64) -> Self {
        RunState {
            request,
            plan: Vec::new(),
            results: Vec::new(),
            intermediate: Map::new(),
            cost_baseline,
        }
    }

    /// Record an intermediate key/value
    pub fn record_intermediate(&mut self, key: &str, value: Value) {
        self.intermediate.insert(key.to_string(), value);
    }

    /// Record a step result
    pub fn record_result(&mut self, result: StepResult) {
        self.results.push(result);
    }

    /// Number of steps executed
    pub fn total_steps(&self) -> usize {
        self.results.len()
    }

    /// Whether run cost since baseline exceeds the budget
    pub fn cost_exceeded(&self, current_cost_total: f64) -> bool {
        let spent = (current_cost_total - self.cost_baseline).max(0.0);
        match self.request.budget.max_cost_usd {
            Some(max) => spent > max,
            None => false,
        }
    }

    /// Whether the run may take another step
    pub fn within_limits(&self, current_cost_total: f64) -> bool {
        (self.total_steps() as u32) < self.request.budget.max_steps
            && !self.cost_exceeded(current_cost_total)
    }

    /// Whether every recorded step succeeded
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    /// Serialize to a dict for persistence
    pub fn to_value(&self) -> Value {
        json!({
            "status": "running",
            "loop_iteration": self.results.len(),
            "cost_baseline": self.cost_baseline,
            "plan": self.plan,
            "results": self.results,
            "intermediate": self.intermediate,
        })
    }
}
