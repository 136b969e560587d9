//! Capability context for orchestrator planning.
//!
//! Summarizes what each sub-agent can currently do: authorized MCP providers
//! (tool names, counts) from the index, and the desktop environment from
//! request metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{ProviderTools, ToolIndex};
use crate::orchestrator::types::OrchestratorRequest;

/// One visible desktop window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowInfo {
    /// Owning application
    #[serde(default)]
    pub app_name: String,
    /// Window title
    #[serde(default)]
    pub title: String,
}

/// Desktop environment visible to the computer-use agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DesktopEnvironment {
    /// OS platform name
    #[serde(default)]
    pub platform: String,
    /// Installed/visible applications
    #[serde(default)]
    pub available_apps: Vec<String>,
    /// Currently open windows
    #[serde(default)]
    pub active_windows: Vec<WindowInfo>,
}

/// Capabilities of both sub-agents for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityContext {
    /// Authorized MCP providers with their tool names
    pub providers: Vec<ProviderTools>,
    /// Desktop environment
    pub desktop: DesktopEnvironment,
}

/// Build the capability context for a request.
pub fn build_capability_context(
    index: &ToolIndex,
    request: &OrchestratorRequest,
) -> CapabilityContext {
    let providers = index.inventory(request.tool_constraints.as_ref());

    let platform = request
        .metadata
        .get("platform")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let available_apps = request
        .metadata
        .get("available_apps")
        .and_then(Value::as_array)
        .map(|apps| {
            apps.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let active_windows = request
        .metadata
        .get("active_windows")
        .and_then(Value::as_array)
        .map(|windows| {
            windows
                .iter()
                .filter_map(|window| {
                    serde_json::from_value::<WindowInfo>(window.clone()).ok()
                })
                .collect()
        })
        .unwrap_or_default();

    CapabilityContext {
        providers,
        desktop: DesktopEnvironment {
            platform,
            available_apps,
            active_windows,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::index::testing::sample_index;
    use serde_json::json;

    #[test]
    fn test_capability_context_from_request() {
        let index = sample_index();
        let mut request = OrchestratorRequest::from_task("tenant", "task");
        request.metadata.insert("platform".into(), json!("macos"));
        request
            .metadata
            .insert("available_apps".into(), json!(["Excel", "Chrome"]));
        request.metadata.insert(
            "active_windows".into(),
            json!([{"app_name": "Chrome", "title": "Inbox"}]),
        );

        let capabilities = build_capability_context(&index, &request);
        assert_eq!(capabilities.providers.len(), 2);
        assert_eq!(capabilities.desktop.platform, "macos");
        assert_eq!(capabilities.desktop.available_apps, vec!["Excel", "Chrome"]);
        assert_eq!(capabilities.desktop.active_windows[0].title, "Inbox");
    }

    #[test]
    fn test_capability_context_defaults() {
        let index = sample_index();
        let request = OrchestratorRequest::from_task("tenant", "task");
        let capabilities = build_capability_context(&index, &request);
        assert_eq!(capabilities.desktop.platform, "unknown");
        assert!(capabilities.desktop.available_apps.is_empty());
    }
}
