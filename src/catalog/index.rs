//! Tool catalog and authorized-provider inventory.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::catalog::descriptor::ToolSpec;
use crate::orchestrator::types::ToolConstraints;

/// One provider's tool names, as exposed to planners and prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTools {
    /// Provider name
    pub provider: String,
    /// Tool names only, no specs
    pub tools: Vec<String>,
}

/// Catalog of available tools plus the authorized-provider view.
///
/// An index is built per user: registration happens once at startup, and the
/// authorized set reflects that user's connected providers.
#[derive(Debug, Default)]
pub struct ToolIndex {
    tools: BTreeMap<String, ToolSpec>,
    authorized_providers: HashSet<String>,
}

impl ToolIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool spec
    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.tool_id(), spec);
    }

    /// Mark a provider as authorized for this user
    pub fn authorize_provider(&mut self, provider: impl Into<String>) {
        self.authorized_providers.insert(provider.into());
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the index has no tools
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Look up a tool by `provider.tool` id
    pub fn get_tool(&self, tool_id: &str) -> Option<&ToolSpec> {
        self.tools.get(tool_id)
    }

    /// Resolve a provider/tool pair to the underlying MCP tool name
    pub fn resolve_mcp_tool_name(&self, provider: &str, tool: &str) -> String {
        self.tools
            .get(&format!("{}.{}", provider, tool))
            .map(|spec| spec.mcp_name.clone())
            .unwrap_or_else(|| tool.to_string())
    }

    /// Whether a provider is authorized
    pub fn is_authorized(&self, provider: &str) -> bool {
        self.authorized_providers.contains(provider)
    }

    /// Check whether a tool is available, with a reason when not
    pub fn check_availability(&self, provider: &str, tool: &str) -> (bool, Option<String>) {
        if !self.is_authorized(provider) {
            return (
                false,
                Some(format!("Provider '{}' is not authorized", provider)),
            );
        }
        let tool_id = format!("{}.{}", provider, tool);
        if !self.tools.contains_key(&tool_id) {
            return (false, Some(format!("Unknown tool '{}'", tool_id)));
        }
        (true, None)
    }

    /// Authorized provider tree (names only), filtered by optional constraints
    pub fn inventory(&self, constraints: Option<&ToolConstraints>) -> Vec<ProviderTools> {
        let mut by_provider: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for spec in self.tools.values() {
            if !self.is_authorized(&spec.provider) {
                continue;
            }
            if let Some(constraints) = constraints {
                if !constraints.allows(&spec.provider, &spec.tool_id()) {
                    continue;
                }
            }
            by_provider
                .entry(spec.provider.as_str())
                .or_default()
                .push(spec.name.clone());
        }
        by_provider
            .into_iter()
            .map(|(provider, tools)| ProviderTools {
                provider: provider.to_string(),
                tools,
            })
            .collect()
    }

    /// All specs for authorized providers (search input)
    pub fn authorized_specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools
            .values()
            .filter(|spec| self.is_authorized(&spec.provider))
    }

    /// Provider names that appear in the registry but are unknown to it.
    ///
    /// Used to reject `tool_constraints` naming providers that don't exist.
    pub fn unknown_providers<'a>(&self, providers: &'a [String]) -> Vec<&'a str> {
        let known: HashSet<&str> = self
            .tools
            .values()
            .map(|spec| spec.provider.as_str())
            .collect();
        providers
            .iter()
            .map(|p| p.as_str())
            .filter(|p| !known.contains(p))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::sample_index;
    use super::*;

    #[test]
    fn test_get_and_resolve() {
        let index = sample_index();
        assert!(index.get_tool("gmail.gmail_search").is_some());
        assert!(index.get_tool("gmail.nope").is_none());
        assert_eq!(
            index.resolve_mcp_tool_name("gmail", "gmail_search"),
            "GMAIL_SEARCH"
        );
    }

    #[test]
    fn test_check_availability() {
        let mut index = sample_index();
        let (ok, reason) = index.check_availability("gmail", "gmail_search");
        assert!(ok);
        assert!(reason.is_none());

        let (ok, reason) = index.check_availability("gmail", "missing");
        assert!(!ok);
        assert!(reason.unwrap().contains("Unknown tool"));

        index.authorized_providers.remove("slack");
        let (ok, reason) = index.check_availability("slack", "slack_post_message");
        assert!(!ok);
        assert!(reason.unwrap().contains("not authorized"));
    }

    #[test]
    fn test_inventory_respects_constraints() {
        let index = sample_index();
        let all = index.inventory(None);
        assert_eq!(all.len(), 2);

        let constraints = ToolConstraints::custom(vec!["gmail".into()], vec![]);
        let filtered = index.inventory(Some(&constraints));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].provider, "gmail");
        assert_eq!(filtered[0].tools.len(), 2);
    }

    #[test]
    fn test_unknown_providers() {
        let index = sample_index();
        let requested = vec!["gmail".to_string(), "hubspot".to_string()];
        assert_eq!(index.unknown_providers(&requested), vec!["hubspot"]);
    }
}
