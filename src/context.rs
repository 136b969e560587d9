//! Per-run context propagated through all downstream calls.
//!
//! A `RunContext` is an explicit value passed through every layer instead of
//! ambient task-locals: it carries run identity plus handles to the shared
//! infrastructure (signals, streaming, cost tracking, request registry, run
//! logger). Cloning is cheap; all handles are `Arc`s.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::cost::TokenCostTracker;
use crate::llm::{LlmRequestRegistry, Usage};
use crate::logging::{AgentLogger, RunLogger};
use crate::signal::SignalBus;
use crate::stream::StreamBus;

/// Immutable run identity + shared infrastructure handles.
#[derive(Clone)]
pub struct RunContext {
    /// Stable opaque run token
    pub run_id: String,
    /// Derived task identifier (user + task hash)
    pub task_id: String,
    /// Tenant owning the run
    pub tenant_id: Option<String>,
    /// Request correlation id
    pub request_id: String,
    /// User the run acts on behalf of
    pub user_id: String,

    /// Pause/resume/cancel signals
    pub signals: Arc<SignalBus>,
    /// Per-run event streaming
    pub stream: Arc<StreamBus>,
    /// Run-wide token/cost accounting (usage deltas, run cost budget)
    pub cost: Arc<TokenCostTracker>,
    /// Delegation-scoped tracker, when a sub-agent delegation is active.
    ///
    /// Each planner delegation gets a fresh tracker for its own cost cap, so
    /// the cap never counts spending by the orchestrator, the translator, or
    /// earlier delegations. Usage is always recorded into `cost` as well.
    pub delegation_cost: Option<Arc<TokenCostTracker>>,
    /// In-flight LLM request registry (cancel/retry)
    pub llm_requests: Arc<LlmRequestRegistry>,
    /// Hierarchical run logger
    pub run_logger: Arc<RunLogger>,
    /// JSONL stream for the current agent scope
    pub logger: AgentLogger,
}

impl RunContext {
    /// Derive a context for a nested agent scope (e.g. `planner`).
    ///
    /// Identity and infrastructure handles are shared; only the logger scope
    /// changes, producing `…/<parent>/<child>/main.jsonl`.
    pub fn child(&self, scope: &str) -> RunContext {
        let nested = format!("{}/{}", self.logger.scope(), scope);
        RunContext {
            logger: self.run_logger.agent(&nested),
            ..self.clone()
        }
    }

    /// Derive a context whose LLM usage also accrues to a delegation tracker.
    pub fn with_delegation_cost(&self, tracker: Arc<TokenCostTracker>) -> RunContext {
        RunContext {
            delegation_cost: Some(tracker),
            ..self.clone()
        }
    }

    /// Record one completion's usage.
    ///
    /// Always lands in the run-wide tracker; also in the delegation tracker
    /// when one is active. Returns the cost of this call in USD.
    pub fn record_llm_usage(&self, model: &str, label: &str, usage: &Usage) -> f64 {
        let cost = self.cost.record_usage(model, label, usage);
        if let Some(ref delegation) = self.delegation_cost {
            delegation.record_usage(model, label, usage);
        }
        cost
    }

    /// Publish a structured event on the run stream and the current log scope.
    ///
    /// Every event is enriched with run identity before redaction, matching
    /// the stream contract (`{run_id, task_id, user_id, …payload}`).
    pub fn emit(&self, event: &str, payload: Value) {
        let enriched = self.enrich(payload);
        self.logger.log_event(event, enriched.clone());
        self.stream.publish(&self.run_id, event, enriched);
    }

    fn enrich(&self, payload: Value) -> Value {
        let mut map = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        map.insert("run_id".to_string(), Value::String(self.run_id.clone()));
        map.insert("task_id".to_string(), Value::String(self.task_id.clone()));
        map.insert("user_id".to_string(), Value::String(self.user_id.clone()));
        Value::Object(map)
    }
}

/// Test-only context construction shared across module tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) fn test_context(dir: &std::path::Path) -> RunContext {
        let run_logger = RunLogger::create(dir, "test task").unwrap();
        let logger = run_logger.agent("orchestrator");
        RunContext {
            run_id: "run-test".into(),
            task_id: "task-test".into(),
            tenant_id: Some("tenant".into()),
            request_id: "req-test".into(),
            user_id: "user-test".into(),
            signals: SignalBus::new(),
            stream: Arc::new(StreamBus::new()),
            cost: Arc::new(TokenCostTracker::new()),
            delegation_cost: None,
            llm_requests: Arc::new(LlmRequestRegistry::new()),
            run_logger,
            logger,
        }
    }
}
