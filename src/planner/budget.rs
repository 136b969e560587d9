//! Budget tracking for planner runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Hard limits for planner runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub max_steps: u32,
    pub max_tool_calls: u32,
    pub max_code_runs: u32,
    pub max_llm_cost_usd: f64,
}

impl Default for Budget {
    fn default() -> Self {
        Budget {
            max_steps: 10,
            max_tool_calls: 30,
            max_code_runs: 5,
            max_llm_cost_usd: 0.50,
        }
    }
}

/// Read-only capture of current usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub steps_taken: u32,
    pub tool_calls: u32,
    pub code_runs: u32,
    pub estimated_llm_cost_usd: f64,
    pub max_steps: u32,
    pub max_tool_calls: u32,
    pub max_code_runs: u32,
    pub max_llm_cost_usd: f64,
    pub exhausted: BTreeMap<String, bool>,
}

impl BudgetSnapshot {
    /// Render as JSON for events and terminal results
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// The first exhausted cap, in evaluation order
    pub fn first_exhausted(&self) -> Option<&'static str> {
        if self.steps_taken >= self.max_steps {
            return Some("max_steps");
        }
        if self.tool_calls >= self.max_tool_calls {
            return Some("max_tool_calls");
        }
        if self.code_runs >= self.max_code_runs {
            return Some("max_code_runs");
        }
        if self.estimated_llm_cost_usd >= self.max_llm_cost_usd {
            return Some("max_llm_cost_usd");
        }
        None
    }
}

/// Mutable tracker used internally by the planner runtime.
#[derive(Debug)]
pub struct BudgetTracker {
    budget: Budget,
    pub steps_taken: u32,
    pub tool_calls: u32,
    pub code_runs: u32,
    pub estimated_llm_cost_usd: f64,
}

impl BudgetTracker {
    /// Create a tracker for a budget
    pub fn new(budget: Budget) -> Self {
        BudgetTracker {
            budget,
            steps_taken: 0,
            tool_calls: 0,
            code_runs: 0,
            estimated_llm_cost_usd: 0.0,
        }
    }

    /// Replace the tracked cost estimate with the current run total
    pub fn update_llm_cost(&mut self, total_cost: f64) {
        self.estimated_llm_cost_usd = total_cost;
    }

    /// Capture current counters against the caps
    pub fn snapshot(&self) -> BudgetSnapshot {
        let mut exhausted = BTreeMap::new();
        exhausted.insert(
            "max_steps".to_string(),
            self.steps_taken >= self.budget.max_steps,
        );
        exhausted.insert(
            "max_tool_calls".to_string(),
            self.tool_calls >= self.budget.max_tool_calls,
        );
        exhausted.insert(
            "max_code_runs".to_string(),
            self.code_runs >= self.budget.max_code_runs,
        );
        exhausted.insert(
            "max_llm_cost_usd".to_string(),
            self.estimated_llm_cost_usd >= self.budget.max_llm_cost_usd,
        );
        BudgetSnapshot {
            steps_taken: self.steps_taken,
            tool_calls: self.tool_calls,
            code_runs: self.code_runs,
            estimated_llm_cost_usd: self.estimated_llm_cost_usd,
            max_steps: self.budget.max_steps,
            max_tool_calls: self.budget.max_tool_calls,
            max_code_runs: self.budget.max_code_runs,
            max_llm_cost_usd: self.budget.max_llm_cost_usd,
            exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_exhaustion_flags() {
        let mut tracker = BudgetTracker::new(Budget {
            max_steps: 2,
            max_tool_calls: 1,
            max_code_runs: 1,
            max_llm_cost_usd: 0.10,
        });
        assert!(tracker.snapshot().first_exhausted().is_none());

        tracker.steps_taken = 2;
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.first_exhausted(), Some("max_steps"));
        assert!(snapshot.exhausted["max_steps"]);
        assert!(!snapshot.exhausted["max_tool_calls"]);
    }

    #[test]
    fn test_cost_exhaustion() {
        let mut tracker = BudgetTracker::new(Budget::default());
        tracker.update_llm_cost(0.50);
        assert_eq!(tracker.snapshot().first_exhausted(), Some("max_llm_cost_usd"));
    }

    #[test]
    fn test_evaluation_order() {
        let mut tracker = BudgetTracker::new(Budget {
            max_steps: 1,
            max_tool_calls: 1,
            max_code_runs: 1,
            max_llm_cost_usd: 0.0,
        });
        tracker.steps_taken = 1;
        tracker.tool_calls = 1;
        // Steps are checked before tool calls and cost.
        assert_eq!(tracker.snapshot().first_exhausted(), Some("max_steps"));
    }
}
