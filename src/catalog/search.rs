//! Relevance-ranked tool search over the catalog.
//!
//! Scoring is lowercased term overlap weighted by match location: tool name
//! matches outweigh provider matches, which outweigh description matches.
//! Good enough to drive discovery discipline; a semantic index can replace
//! this behind the same signature.

use crate::catalog::descriptor::ToolDescriptor;
use crate::catalog::index::ToolIndex;

/// Default number of results returned when the planner omits a limit
pub const DEFAULT_SEARCH_LIMIT: usize = 10;
/// Hard ceiling on requested limits
pub const MAX_SEARCH_LIMIT: usize = 50;

/// Search the catalog for tools matching a query.
pub fn search_tools(
    index: &ToolIndex,
    query: &str,
    provider_filter: Option<&str>,
    limit: Option<usize>,
) -> Vec<ToolDescriptor> {
    let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, MAX_SEARCH_LIMIT);
    let terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if terms.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(f64, ToolDescriptor)> = index
        .authorized_specs()
        .filter(|spec| provider_filter.map(|p| spec.provider == p).unwrap_or(true))
        .filter_map(|spec| {
            let score = score_spec(&terms, &spec.name, &spec.provider, &spec.description);
            if score > 0.0 {
                Some((score, spec.descriptor(score)))
            } else {
                None
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.tool_id.cmp(&b.1.tool_id))
    });
    scored.into_iter().take(limit).map(|(_, d)| d).collect()
}

fn score_spec(terms: &[String], name: &str, provider: &str, description: &str) -> f64 {
    let name = name.to_lowercase();
    let provider = provider.to_lowercase();
    let description = description.to_lowercase();

    let mut score = 0.0;
    for term in terms {
        if name.contains(term.as_str()) {
            score += 3.0;
        }
        if provider.contains(term.as_str()) {
            score += 2.0;
        }
        if description.contains(term.as_str()) {
            score += 1.0;
        }
    }
    score / terms.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::index::testing::sample_index;

    #[test]
    fn test_search_ranks_name_matches_first() {
        let index = sample_index();
        let results = search_tools(&index, "gmail search emails", None, None);
        assert!(!results.is_empty());
        assert_eq!(results[0].tool_id, "gmail.gmail_search");
        assert!(results[0].score > 0.0);
    }

    #[test]
    fn test_search_provider_filter() {
        let index = sample_index();
        let results = search_tools(&index, "message", Some("slack"), None);
        assert!(results.iter().all(|d| d.server == "slack"));
    }

    #[test]
    fn test_search_empty_query_returns_nothing() {
        let index = sample_index();
        assert!(search_tools(&index, "   ", None, None).is_empty());
    }

    #[test]
    fn test_search_limit_clamped() {
        let index = sample_index();
        let results = search_tools(&index, "gmail", None, Some(1));
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_search_no_match() {
        let index = sample_index();
        assert!(search_tools(&index, "zzzqqq", None, None).is_empty());
    }
}
