//! Sandboxed code execution.
//!
//! - [`toolbox`]: per-run generated `sandbox_py` stub package
//! - [`analyze`]: static analysis of plan bodies before execution
//! - [`bridge`]: loopback tool-call bridge serving the subprocess
//! - [`runner`]: subprocess spawn, sentinel parsing, timeout enforcement

pub mod analyze;
pub mod bridge;
pub mod runner;
pub mod toolbox;

pub use analyze::{analyze_sandbox, check_syntax, find_forbidden_wrapper, SandboxAnalysis};
pub use bridge::SandboxBridge;
pub use runner::{build_plan_source, parse_process_output, SandboxResult, SandboxRunner, SENTINEL};
pub use toolbox::Toolbox;
