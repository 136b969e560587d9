//! # Foreman
//!
//! A hierarchical LLM agent runtime built with Rust.
//!
//! ## Architecture
//!
//! Foreman runs user tasks through two cooperating loops:
//!
//! - **Orchestrator** (`orchestrator`): the outer loop. Decides one atomic
//!   step at a time, dispatches it to a sub-agent bridge, and re-plans over
//!   the translated result until the task is complete or impossible.
//! - **Planner** (`planner`): the inner loop behind the MCP bridge. Searches
//!   a tool catalog, invokes provider tools, and runs sandboxed Python, then
//!   returns a self-contained markdown trajectory.
//!
//! Supporting subsystems:
//!
//! - **LLM facade** (`llm`): provider-agnostic access with retry, routing,
//!   cancellation polling, and cost accounting
//! - **Tool catalog** (`catalog`): specs, search, inventory, schema folding
//! - **Sandbox** (`sandbox`): generated stub toolbox + isolated subprocess
//! - **Shared infrastructure**: signals (`signal`), event streams (`stream`),
//!   cost tracking (`cost`), hierarchical run logs (`logging`)
//!
//! ## Design Principles
//!
//! 1. **Narrow seams**: provider actions, sub-agents, and LLM backends are
//!    consumed through traits (`ToolDispatcher`, `SubAgentBridge`,
//!    `LlmBackend`); nothing in the core implements them
//! 2. **Explicit context**: a `RunContext` value travels through every call;
//!    no ambient task-locals
//! 3. **Sequential within a run, parallel across runs**: a semaphore bounds
//!    concurrent runs; inside a run both loops are strictly serial
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use foreman::config::Config;
//! use foreman::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load configuration from environment
//!     let config = Config::from_env()?;
//!     config.validate()?;
//!
//!     // Build an OrchestratorRuntime with your ToolDispatcher and run tasks...
//!     Ok(())
//! }
//! ```

// Tool catalog: specs, descriptors, inventory, search
pub mod catalog;

// Configuration
pub mod config;

// Per-run context propagated through all calls
pub mod context;

// Token usage and cost accounting
pub mod cost;

// Tool dispatch contract (Envelope + ToolDispatcher)
pub mod dispatch;

// Error types
pub mod error;

// Provider-agnostic LLM access
pub mod llm;

// Hierarchical per-run logging
pub mod logging;

// The outer orchestrator loop
pub mod orchestrator;

// The inner MCP planner loop
pub mod planner;

// Sandboxed code execution
pub mod sandbox;

// Pause/resume/cancel signaling
pub mod signal;

// Per-run event streaming
pub mod stream;

// Token estimation
pub mod tokens;

// Re-export commonly used items
pub use error::{Error, Result};

pub use context::RunContext;
pub use dispatch::{Envelope, ToolDispatcher};
pub use orchestrator::{OrchestratorRequest, OrchestratorRuntime, RunState};
pub use planner::{execute_mcp_task, Budget, McpTaskResult};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
