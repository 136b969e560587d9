//! Ephemeral sandbox toolbox generation.
//!
//! Each planner run gets a temporary `sandbox_py` package so sandbox code can
//! import provider helpers (`from sandbox_py.servers import gmail`) without a
//! persisted toolbox on disk. Stub functions mirror the registered action
//! signatures and proxy every call through `sandbox_py.client.call_tool`,
//! the only capability that crosses the process boundary.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::catalog::{ParamSpec, ToolIndex, ToolSpec};
use crate::error::Result;

/// A generated per-run toolbox rooted at a temp directory.
///
/// The directory (and everything generated into it) is removed on drop.
#[derive(Debug)]
pub struct Toolbox {
    dir: TempDir,
}

impl Toolbox {
    /// Generate a `sandbox_py` package for the providers exposed to this user.
    pub fn generate(index: &ToolIndex, user_id: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("toolbox-{}-", sanitize(user_id)))
            .tempdir()?;

        let base = dir.path().join("sandbox_py");
        let servers_dir = base.join("servers");
        fs::create_dir_all(&servers_dir)?;

        write_base_init(&base)?;
        write_helpers_module(&base)?;
        write_client_module(&base.join("client.py"))?;

        let mut generated: Vec<String> = Vec::new();
        let mut by_provider: std::collections::BTreeMap<&str, Vec<&ToolSpec>> =
            std::collections::BTreeMap::new();
        for spec in index.authorized_specs() {
            by_provider
                .entry(spec.provider.as_str())
                .or_default()
                .push(spec);
        }
        for (provider, mut specs) in by_provider {
            specs.sort_by(|a, b| a.name.cmp(&b.name));
            let module_path = servers_dir.join(format!("{}.py", provider));
            write_provider_module(&module_path, provider, &specs)?;
            generated.push(provider.to_string());
        }
        write_servers_init(&servers_dir, &generated)?;

        Ok(Toolbox { dir })
    }

    /// Path added to the sandbox subprocess `PYTHONPATH`
    pub fn python_path(&self) -> &Path {
        self.dir.path()
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

fn write_base_init(base: &Path) -> Result<()> {
    let content = "\
from . import client, servers, helpers
from .helpers import safe_error_text, safe_timestamp_sort_key, is_tool_successful

__all__ = [
    \"client\",
    \"servers\",
    \"helpers\",
    \"safe_error_text\",
    \"safe_timestamp_sort_key\",
    \"is_tool_successful\",
]
";
    fs::write(base.join("__init__.py"), content)?;
    Ok(())
}

fn write_servers_init(servers_dir: &Path, providers: &[String]) -> Result<()> {
    let mut lines = vec!["from __future__ import annotations".to_string(), String::new()];
    for provider in providers {
        lines.push(format!("from . import {}", provider));
    }
    lines.push(String::new());
    let exports = providers
        .iter()
        .map(|name| format!("\"{}\"", name))
        .collect::<Vec<_>>()
        .join(", ");
    lines.push(format!("__all__ = [{}]", exports));
    fs::write(servers_dir.join("__init__.py"), lines.join("\n") + "\n")?;
    Ok(())
}

fn write_helpers_module(base: &Path) -> Result<()> {
    let content = r#""""Sandbox helper utilities exposed to generated plans."""

from datetime import datetime


def safe_error_text(value):
    """Return a safe string when concatenating provider errors."""
    if not value:
        return ""
    return value if isinstance(value, str) else str(value)


def is_tool_successful(payload):
    """Return True if a tool payload indicates success."""
    if not isinstance(payload, dict):
        return False

    top_success = None
    if "successful" in payload:
        top_success = bool(payload.get("successful"))

    data = payload.get("data")
    nested_success = None
    nested_error = None
    if isinstance(data, dict):
        if "successful" in data:
            nested_success = bool(data.get("successful"))
        if "error" in data:
            nested_error = data.get("error")

    # Nested failure overrides any optimistic top-level flag.
    if nested_success is False:
        return False
    if nested_error not in (None, "", False):
        return False

    top_error = payload.get("error")
    if top_error not in (None, "", False):
        return False

    if nested_success is True:
        return True
    if top_success is not None:
        return top_success
    return False


def safe_timestamp_sort_key(value):
    """Convert provider timestamps (ints or ISO strings) into sortable ints."""
    if value is None:
        return 0
    if isinstance(value, (int, float)):
        return value
    if isinstance(value, str):
        try:
            return int(value)
        except ValueError:
            try:
                cleaned = value.replace("Z", "+00:00")
                return int(datetime.fromisoformat(cleaned).timestamp())
            except Exception:
                return 0
    return 0
"#;
    fs::write(base.join("helpers.py"), content)?;
    Ok(())
}

fn write_client_module(path: &PathBuf) -> Result<()> {
    let content = r#""""Tool-call client for sandbox plans.

`call_tool` is the single capability crossing the sandbox boundary. It speaks
one-line JSON over a loopback connection to the bridge the host binds for the
duration of this run (SANDBOX_BRIDGE_PORT).
"""

from __future__ import annotations

import json
import os
import socket


def sanitize_payload(payload):
    """Remove None values before transmission."""
    return {k: v for k, v in payload.items() if v is not None}


async def call_tool(provider, tool, payload):
    """Invoke a provider tool via the host bridge and return its envelope."""
    sanitized = sanitize_payload(dict(payload or {}))
    port = int(os.environ.get("SANDBOX_BRIDGE_PORT", "0"))
    if not port:
        return {
            "successful": False,
            "data": None,
            "error": "sandbox bridge unavailable",
            "logs": None,
        }
    request = json.dumps({"provider": provider, "tool": tool, "payload": sanitized})
    try:
        with socket.create_connection(("127.0.0.1", port), timeout=60) as conn:
            conn.sendall((request + "\n").encode("utf-8"))
            reader = conn.makefile("r", encoding="utf-8")
            line = reader.readline()
    except OSError as exc:
        return {
            "successful": False,
            "data": None,
            "error": "sandbox bridge error: " + str(exc),
            "logs": None,
        }
    if not line:
        return {
            "successful": False,
            "data": None,
            "error": "sandbox bridge returned no response",
            "logs": None,
        }
    return json.loads(line)


__all__ = ["call_tool", "sanitize_payload"]
"#;
    fs::write(path, content)?;
    Ok(())
}

fn write_provider_module(path: &Path, provider: &str, specs: &[&ToolSpec]) -> Result<()> {
    let mut lines: Vec<String> = vec![
        "from __future__ import annotations".to_string(),
        String::new(),
        "from sandbox_py.client import call_tool, sanitize_payload".to_string(),
        String::new(),
        format!("# Ephemeral stubs for provider '{}'.", provider),
        String::new(),
    ];

    for spec in specs {
        lines.extend(render_tool_function(provider, spec));
        if let Some(alias) = camel_case_alias(&spec.name) {
            lines.push(format!("{} = {}", alias, spec.name));
            lines.push(String::new());
        }
    }

    fs::write(path, lines.join("\n").trim_end().to_string() + "\n")?;
    Ok(())
}

fn render_tool_function(provider: &str, spec: &ToolSpec) -> Vec<String> {
    let params = render_params(&spec.input_params);
    let mut lines = vec![format!("async def {}({}):", spec.name, params)];
    if !spec.mcp_name.is_empty() {
        lines.push(format!("    # Underlying MCP tool: {}", spec.mcp_name));
    }
    lines.push("    payload = {}".to_string());
    for param in &spec.input_params {
        if param.required {
            lines.push(format!("    payload['{}'] = {}", param.name, param.name));
        } else {
            lines.push(format!("    if {} is not None:", param.name));
            lines.push(format!("        payload['{}'] = {}", param.name, param.name));
        }
    }
    lines.push("    payload = sanitize_payload(payload)".to_string());
    lines.push(format!(
        "    return await call_tool('{}', '{}', payload)",
        provider, spec.name
    ));
    lines.push(String::new());
    lines
}

fn render_params(params: &[ParamSpec]) -> String {
    let mut rendered: Vec<String> = Vec::new();
    for param in params.iter().filter(|p| p.required) {
        rendered.push(param.name.clone());
    }
    for param in params.iter().filter(|p| !p.required) {
        match &param.default {
            Some(default) => rendered.push(format!("{}={}", param.name, python_literal(default))),
            None => rendered.push(format!("{}=None", param.name)),
        }
    }
    rendered.join(", ")
}

fn python_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "None".to_string(),
        serde_json::Value::Bool(true) => "True".to_string(),
        serde_json::Value::Bool(false) => "False".to_string(),
        serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "\\'")),
        other => other.to_string(),
    }
}

fn camel_case_alias(name: &str) -> Option<String> {
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() <= 1 {
        return None;
    }
    let mut alias = parts[0].to_string();
    for part in &parts[1..] {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            alias.push(first.to_ascii_uppercase());
            alias.extend(chars);
        }
    }
    if alias == name {
        None
    } else {
        Some(alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::index::testing::sample_index;

    #[test]
    fn test_generate_layout() {
        let index = sample_index();
        let toolbox = Toolbox::generate(&index, "user@example.com").unwrap();
        let base = toolbox.python_path().join("sandbox_py");

        assert!(base.join("__init__.py").exists());
        assert!(base.join("helpers.py").exists());
        assert!(base.join("client.py").exists());
        assert!(base.join("servers/__init__.py").exists());
        assert!(base.join("servers/gmail.py").exists());
        assert!(base.join("servers/slack.py").exists());
    }

    #[test]
    fn test_provider_stub_shape() {
        let index = sample_index();
        let toolbox = Toolbox::generate(&index, "u1").unwrap();
        let module =
            fs::read_to_string(toolbox.python_path().join("sandbox_py/servers/gmail.py")).unwrap();

        // Required params positional, optionals defaulted to None.
        assert!(module.contains("async def gmail_search(query, max_results=None):"));
        assert!(module.contains("if max_results is not None:"));
        assert!(module.contains("return await call_tool('gmail', 'gmail_search', payload)"));
        // camelCase alias emitted alongside the snake_case stub.
        assert!(module.contains("gmailSearch = gmail_search"));
    }

    #[test]
    fn test_toolbox_removed_on_drop() {
        let index = sample_index();
        let toolbox = Toolbox::generate(&index, "u1").unwrap();
        let path = toolbox.python_path().to_path_buf();
        assert!(path.exists());
        drop(toolbox);
        assert!(!path.exists());
    }

    #[test]
    fn test_camel_case_alias() {
        assert_eq!(camel_case_alias("gmail_search"), Some("gmailSearch".into()));
        assert_eq!(camel_case_alias("search"), None);
    }
}
