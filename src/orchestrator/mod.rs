//! The outer orchestrator loop.
//!
//! - [`types`]: canonical request/state/result shapes
//! - [`capabilities`]: capability context fed into the system prompt
//! - [`prompt`]: dynamic system prompt construction
//! - [`translator`]: trajectory markdown → canonical JSON
//! - [`bridge`]: sub-agent bridge contract and implementations
//! - [`runtime`]: the decision/dispatch loop and concurrency limiter

pub mod bridge;
pub mod capabilities;
pub mod prompt;
pub mod runtime;
pub mod translator;
pub mod types;

pub use bridge::{McpBridge, StubComputerUseBridge, SubAgentBridge};
pub use capabilities::{build_capability_context, CapabilityContext, DesktopEnvironment};
pub use prompt::build_system_prompt;
pub use runtime::OrchestratorRuntime;
pub use translator::{deterministic_fallback, translate_step_output};
pub use types::{
    generate_step_id, AgentTarget, ConstraintMode, OrchestratorRequest, PlannedStep, RunBudget,
    RunState, StepResult, StepStatus, TenantContext, ToolConstraints,
};
