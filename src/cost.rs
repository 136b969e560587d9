//! Token usage and cost accounting.
//!
//! A `TokenCostTracker` accumulates per-call token usage with model-specific
//! USD rates. Trackers are scoped to what they budget: the runtime creates
//! one per run (step usage deltas, run cost cap) and each planner delegation
//! creates its own (inner cost cap), so no scope ever counts another scope's
//! spending. The orchestrator snapshots totals before each dispatched step
//! and computes a delta afterwards, so step results carry the usage they
//! actually consumed.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::llm::Usage;

/// Per-million-token USD rates for one model.
#[derive(Debug, Clone, Copy)]
pub struct ModelRates {
    pub input_per_million: f64,
    pub cached_input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for ModelRates {
    fn default() -> Self {
        // Conservative default applied to unknown models.
        ModelRates {
            input_per_million: 2.0,
            cached_input_per_million: 0.5,
            output_per_million: 8.0,
        }
    }
}

/// One recorded LLM completion.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub model: String,
    pub label: String,
    pub cached_input_tokens: u64,
    pub new_input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Point-in-time capture of the tracker totals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostSnapshot {
    pub total_input_cached: u64,
    pub total_input_new: u64,
    pub total_output: u64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Default)]
struct Inner {
    totals: CostSnapshot,
    calls: Vec<CallRecord>,
}

/// Thread-safe accumulation of per-call token usage and cost.
#[derive(Debug)]
pub struct TokenCostTracker {
    inner: Mutex<Inner>,
    rates: HashMap<String, ModelRates>,
}

impl Default for TokenCostTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCostTracker {
    /// Create a tracker with the built-in rate table
    pub fn new() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            "openai/o4-mini".to_string(),
            ModelRates {
                input_per_million: 1.10,
                cached_input_per_million: 0.275,
                output_per_million: 4.40,
            },
        );
        rates.insert(
            "anthropic/claude-3.5-sonnet".to_string(),
            ModelRates {
                input_per_million: 3.0,
                cached_input_per_million: 0.30,
                output_per_million: 15.0,
            },
        );
        TokenCostTracker {
            inner: Mutex::new(Inner::default()),
            rates,
        }
    }

    /// Record one completion's usage; returns the cost of this call in USD
    pub fn record_usage(&self, model: &str, label: &str, usage: &Usage) -> f64 {
        let rates = self.rates.get(model).copied().unwrap_or_default();
        let cost = usage.new_input_tokens as f64 / 1_000_000.0 * rates.input_per_million
            + usage.cached_input_tokens as f64 / 1_000_000.0 * rates.cached_input_per_million
            + usage.output_tokens as f64 / 1_000_000.0 * rates.output_per_million;

        let mut inner = self.inner.lock().expect("cost tracker lock poisoned");
        inner.totals.total_input_cached += usage.cached_input_tokens;
        inner.totals.total_input_new += usage.new_input_tokens;
        inner.totals.total_output += usage.output_tokens;
        inner.totals.total_cost_usd += cost;
        inner.calls.push(CallRecord {
            model: model.to_string(),
            label: label.to_string(),
            cached_input_tokens: usage.cached_input_tokens,
            new_input_tokens: usage.new_input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: cost,
        });
        cost
    }

    /// Capture current totals
    pub fn snapshot(&self) -> CostSnapshot {
        self.inner.lock().expect("cost tracker lock poisoned").totals
    }

    /// Total USD spent across all runs in this process
    pub fn total_cost_usd(&self) -> f64 {
        self.snapshot().total_cost_usd
    }

    /// Usage consumed since a baseline snapshot, shaped for step results
    pub fn usage_since(&self, baseline: &CostSnapshot) -> Value {
        let now = self.snapshot();
        json!({
            "tokens": {
                "input_cached": now.total_input_cached.saturating_sub(baseline.total_input_cached),
                "input_new": now.total_input_new.saturating_sub(baseline.total_input_new),
                "output": now.total_output.saturating_sub(baseline.total_output),
            },
            "cost_usd": {
                "delta": (now.total_cost_usd - baseline.total_cost_usd).max(0.0),
                "run_total": now.total_cost_usd,
            },
        })
    }

    /// Most recent call records (for JSONL export)
    pub fn recent_calls(&self, limit: usize) -> Vec<CallRecord> {
        let inner = self.inner.lock().expect("cost tracker lock poisoned");
        let start = inner.calls.len().saturating_sub(limit);
        inner.calls[start..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(cached: u64, new: u64, output: u64) -> Usage {
        Usage {
            cached_input_tokens: cached,
            new_input_tokens: new,
            output_tokens: output,
        }
    }

    #[test]
    fn test_record_usage_accumulates() {
        let tracker = TokenCostTracker::new();
        tracker.record_usage("openai/o4-mini", "planner.llm", &usage(0, 1000, 500));
        tracker.record_usage("openai/o4-mini", "planner.llm", &usage(100, 900, 250));

        let snap = tracker.snapshot();
        assert_eq!(snap.total_input_cached, 100);
        assert_eq!(snap.total_input_new, 1900);
        assert_eq!(snap.total_output, 750);
        assert!(snap.total_cost_usd > 0.0);
    }

    #[test]
    fn test_usage_since_baseline() {
        let tracker = TokenCostTracker::new();
        tracker.record_usage("openai/o4-mini", "a", &usage(0, 100, 50));
        let baseline = tracker.snapshot();
        tracker.record_usage("openai/o4-mini", "b", &usage(0, 300, 100));

        let delta = tracker.usage_since(&baseline);
        assert_eq!(delta["tokens"]["input_new"], 300);
        assert_eq!(delta["tokens"]["output"], 100);
        assert!(delta["cost_usd"]["delta"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_unknown_model_uses_default_rates() {
        let tracker = TokenCostTracker::new();
        let cost = tracker.record_usage("unknown/model", "x", &usage(0, 1_000_000, 0));
        assert!((cost - 2.0).abs() < 1e-9);
    }
}
