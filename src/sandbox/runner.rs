//! Sandboxed Python plan execution.
//!
//! Runs a user-supplied statement body as the body of an async `main()` in an
//! isolated subprocess. The subprocess sees only the generated toolbox on its
//! `PYTHONPATH`; results come back as a single sentinel-framed JSON message
//! on stdout. The child is guaranteed to be gone before this call returns,
//! timeout included.

use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::context::RunContext;
use crate::dispatch::ToolDispatcher;
use crate::error::{Error, Result};
use crate::sandbox::bridge::SandboxBridge;
use crate::sandbox::toolbox::Toolbox;

/// Marker separating print noise from the JSON result on stdout
pub const SENTINEL: &str = "___FM_RESULT___";

/// Result of one sandbox plan execution.
#[derive(Debug, Clone)]
pub struct SandboxResult {
    /// Process exited 0 and produced a sentinel-framed result
    pub success: bool,
    /// Parsed result payload, when present
    pub result: Option<Value>,
    /// Captured log lines (pre-sentinel stdout + stderr)
    pub logs: Vec<String>,
    /// Error description on failure
    pub error: Option<String>,
    /// Whether the run was killed on timeout
    pub timed_out: bool,
}

/// Executes sandbox plans against a generated toolbox.
pub struct SandboxRunner {
    python: PathBuf,
    timeout: Duration,
    debug_dir: Option<PathBuf>,
    dispatcher: Arc<dyn ToolDispatcher>,
}

impl SandboxRunner {
    /// Create a runner; discovers the interpreter from PATH when unset.
    pub fn new(config: &SandboxConfig, dispatcher: Arc<dyn ToolDispatcher>) -> Result<Self> {
        let python = match &config.python {
            Some(path) => path.clone(),
            None => which::which("python3")
                .or_else(|_| which::which("python"))
                .map_err(|_| {
                    Error::Sandbox("Unable to find a python interpreter on PATH".to_string())
                })?,
        };
        Ok(SandboxRunner {
            python,
            timeout: Duration::from_secs(config.timeout_secs),
            debug_dir: config.debug_dir.clone(),
            dispatcher,
        })
    }

    /// Execute a statement body against the toolbox.
    pub async fn run_plan(
        &self,
        ctx: &RunContext,
        toolbox: &Toolbox,
        code_body: &str,
        label: &str,
    ) -> Result<SandboxResult> {
        let body = if code_body.trim().is_empty() {
            "    pass"
        } else {
            code_body
        };
        let plan_source = build_plan_source(body);

        let work_dir = tempfile::Builder::new()
            .prefix(&format!("sandbox-{}-", sanitize(&ctx.user_id)))
            .tempdir()?;
        let plan_path = work_dir.path().join("plan.py");
        tokio::fs::write(&plan_path, &plan_source).await?;

        if let Some(ref debug_dir) = self.debug_dir {
            let _ = std::fs::create_dir_all(debug_dir);
            let snapshot = debug_dir.join(format!("plan_{}_{}.py", sanitize(&ctx.user_id), label));
            let _ = std::fs::write(snapshot, &plan_source);
        }

        let bridge = SandboxBridge::start(ctx.clone(), Arc::clone(&self.dispatcher)).await?;

        debug!(
            "Spawning sandbox plan label={} python={}",
            label,
            self.python.display()
        );

        let mut child = Command::new(&self.python)
            .arg(&plan_path)
            .current_dir(work_dir.path())
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("PYTHONPATH", toolbox.python_path())
            .env("RUN_USER_ID", &ctx.user_id)
            .env("RUN_REQUEST_ID", &ctx.request_id)
            .env("SANDBOX_BRIDGE_PORT", bridge.port().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Sandbox(format!("Failed to spawn sandbox process: {}", e)))?;

        let outcome = tokio::time::timeout(self.timeout, child.wait_with_output()).await;

        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::Sandbox(format!("Sandbox process error: {}", e))),
            Err(_) => {
                // Timeout: the child was moved into wait_with_output, which
                // drops it on timeout; kill_on_drop reaps it.
                warn!("Sandbox plan '{}' timed out after {:?}", label, self.timeout);
                return Ok(SandboxResult {
                    success: false,
                    result: None,
                    logs: vec![],
                    error: Some(format!(
                        "sandbox timed out after {}s",
                        self.timeout.as_secs()
                    )),
                    timed_out: true,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let (mut logs, parsed_result) = parse_process_output(&stdout);
        let stderr_lines: Vec<String> = stderr
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        logs.extend(stderr_lines.iter().cloned());

        let exit_code = output.status.code().unwrap_or(-1);
        let success = output.status.success() && parsed_result.is_some();
        let error = if success {
            None
        } else {
            let detail = stderr_lines
                .first()
                .or(logs.first())
                .map(|line| line.trim().to_string())
                .unwrap_or_default();
            let base = if exit_code != 0 {
                format!("sandbox exited with code {}", exit_code)
            } else {
                "sandbox produced no result".to_string()
            };
            Some(if detail.is_empty() {
                base
            } else {
                format!("{}: {}", base, truncate(&detail, 200))
            })
        };

        Ok(SandboxResult {
            success,
            result: parsed_result,
            logs,
            error,
            timed_out: false,
        })
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

/// Build the complete plan source wrapping a user statement body.
pub fn build_plan_source(code_body: &str) -> String {
    let indented: String = code_body
        .trim_end()
        .lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("    {}", line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"import asyncio
import json
import sys
import traceback


class _SandboxNullWriter:
    def write(self, _):
        pass

    def flush(self):
        pass


_ORIGINAL_STDOUT = sys.stdout
_ORIGINAL_STDERR = sys.stderr
sys.stdout = _SandboxNullWriter()
sys.stderr = _SandboxNullWriter()
from sandbox_py.helpers import safe_error_text, safe_timestamp_sort_key, is_tool_successful  # noqa: F401
from sandbox_py.client import call_tool  # noqa: F401
from sandbox_py import servers  # noqa: F401

SENTINEL = "{sentinel}"


async def main():
{body}


def _emit_result(payload):
    sys.stdout = _ORIGINAL_STDOUT
    sys.stderr = _ORIGINAL_STDERR
    sys.stdout.write(SENTINEL + json.dumps(payload if payload is not None else {{}}, default=str))
    sys.stdout.flush()


if __name__ == "__main__":
    try:
        result = asyncio.run(main())
    except Exception as exc:
        error_payload = {{
            "successful": False,
            "error": "Sandbox error: " + str(exc),
            "traceback": traceback.format_exc(),
            "data": {{}},
        }}
        _emit_result(error_payload)
    else:
        _emit_result(result)
"#,
        sentinel = SENTINEL,
        body = if indented.is_empty() {
            "    pass".to_string()
        } else {
            indented
        },
    )
}

/// Split stdout around the sentinel: pre-sentinel lines are logs, the JSON
/// after it is the result.
pub fn parse_process_output(stdout: &str) -> (Vec<String>, Option<Value>) {
    let Some(position) = stdout.find(SENTINEL) else {
        let logs = stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        return (logs, None);
    };

    let (pre, rest) = stdout.split_at(position);
    let json_text = rest[SENTINEL.len()..].trim();
    let mut logs: Vec<String> = pre
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if json_text.is_empty() {
        return (logs, Some(Value::Object(Default::default())));
    }
    match serde_json::from_str::<Value>(json_text) {
        Ok(value) => (logs, Some(value)),
        Err(_) => {
            logs.push("Failed to parse sandbox result JSON.".to_string());
            (logs, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::index::testing::sample_index;
    use crate::dispatch::Envelope;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::tempdir;

    struct StaticDispatcher(Value);

    #[async_trait]
    impl ToolDispatcher for StaticDispatcher {
        async fn dispatch_tool(
            &self,
            _ctx: &RunContext,
            _provider: &str,
            _tool: &str,
            _payload: Value,
        ) -> Result<Envelope> {
            Ok(Envelope::success(self.0.clone()))
        }
    }

    fn runner(timeout_secs: u64) -> Option<SandboxRunner> {
        if which::which("python3").is_err() && which::which("python").is_err() {
            return None;
        }
        let config = SandboxConfig {
            python: None,
            timeout_secs,
            debug_dir: None,
        };
        Some(
            SandboxRunner::new(&config, Arc::new(StaticDispatcher(json!({"items": [1, 2]}))))
                .unwrap(),
        )
    }

    #[test]
    fn test_parse_process_output_with_sentinel() {
        let stdout = format!("log line\n{}{}", SENTINEL, r#"{"count": 2}"#);
        let (logs, result) = parse_process_output(&stdout);
        assert_eq!(logs, vec!["log line"]);
        assert_eq!(result.unwrap()["count"], 2);
    }

    #[test]
    fn test_parse_process_output_missing_sentinel() {
        let (logs, result) = parse_process_output("just noise\n");
        assert_eq!(logs, vec!["just noise"]);
        assert!(result.is_none());
    }

    #[test]
    fn test_build_plan_source_indents_body() {
        let source = build_plan_source("x = 1\nreturn {\"x\": x}");
        assert!(source.contains("async def main():\n    x = 1\n    return {\"x\": x}"));
        assert!(source.contains(SENTINEL));
    }

    #[tokio::test]
    async fn test_run_plan_pure_computation() {
        let Some(runner) = runner(30) else { return };
        let dir = tempdir().unwrap();
        let ctx = crate::context::testing::test_context(dir.path());
        let toolbox = Toolbox::generate(&sample_index(), "u1").unwrap();

        let result = runner
            .run_plan(
                &ctx,
                &toolbox,
                "values = sorted(set([3, 1, 4, 1, 5, 9, 2, 6]))\nreturn {\"sorted_unique\": values}",
                "analysis",
            )
            .await
            .unwrap();

        assert!(result.success, "error: {:?} logs: {:?}", result.error, result.logs);
        assert_eq!(
            result.result.unwrap()["sorted_unique"],
            json!([1, 2, 3, 4, 5, 6, 9])
        );
    }

    #[tokio::test]
    async fn test_run_plan_tool_call_through_bridge() {
        let Some(runner) = runner(30) else { return };
        let dir = tempdir().unwrap();
        let ctx = crate::context::testing::test_context(dir.path());
        let toolbox = Toolbox::generate(&sample_index(), "u1").unwrap();

        let code = "\
from sandbox_py.servers import gmail
resp = await gmail.gmail_search(query='from:alice@example.com', max_results=3)
return {\"search\": resp}";
        let result = runner.run_plan(&ctx, &toolbox, code, "fetch").await.unwrap();

        assert!(result.success, "error: {:?} logs: {:?}", result.error, result.logs);
        let payload = result.result.unwrap();
        assert_eq!(payload["search"]["successful"], true);
        assert_eq!(payload["search"]["data"]["items"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_run_plan_exception_becomes_error_envelope() {
        let Some(runner) = runner(30) else { return };
        let dir = tempdir().unwrap();
        let ctx = crate::context::testing::test_context(dir.path());
        let toolbox = Toolbox::generate(&sample_index(), "u1").unwrap();

        let result = runner
            .run_plan(&ctx, &toolbox, "raise ValueError('boom')", "broken")
            .await
            .unwrap();

        // The template converts exceptions into an error envelope result.
        assert!(result.success);
        let payload = result.result.unwrap();
        assert_eq!(payload["successful"], false);
        assert!(payload["error"].as_str().unwrap().contains("boom"));
        assert!(payload["traceback"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_run_plan_timeout_kills_child() {
        let Some(runner) = runner(1) else { return };
        let dir = tempdir().unwrap();
        let ctx = crate::context::testing::test_context(dir.path());
        let toolbox = Toolbox::generate(&sample_index(), "u1").unwrap();

        let result = runner
            .run_plan(&ctx, &toolbox, "import time\ntime.sleep(30)\nreturn {}", "slow")
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.timed_out);
        assert!(result.error.unwrap().contains("timed out"));
    }
}
