//! Shared fixtures for integration tests: scripted LLM backends, a stub tool
//! dispatcher, and a small catalog.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use foreman::catalog::{ParamSpec, ToolIndex, ToolSpec};
use foreman::context::RunContext;
use foreman::cost::TokenCostTracker;
use foreman::dispatch::{Envelope, ToolDispatcher};
use foreman::error::{Error, Result};
use foreman::llm::{LlmBackend, LlmRequest, LlmResponse, Usage};
use foreman::logging::RunLogger;
use foreman::signal::SignalBus;
use foreman::stream::StreamBus;

/// Backend that replays a scripted sequence of responses and records every
/// request it serves.
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<String>>,
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(ScriptedBackend {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Concatenated text of the request at `index`
    pub fn request_text(&self, index: usize) -> String {
        let requests = self.requests.lock().unwrap();
        requests[index]
            .messages
            .iter()
            .map(|m| m.text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(text) => Ok(LlmResponse {
                text,
                model: request.model.clone(),
                usage: Usage {
                    cached_input_tokens: 0,
                    new_input_tokens: 100,
                    output_tokens: 50,
                },
            }),
            None => Err(Error::Internal("scripted responses exhausted".into())),
        }
    }
}

/// Dispatcher returning canned envelopes per `provider.tool`, recording calls.
pub struct StubDispatcher {
    responses: HashMap<String, Envelope>,
    pub calls: Mutex<Vec<(String, String, Value)>>,
}

impl StubDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(StubDispatcher {
            responses: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn with_response(provider: &str, tool: &str, envelope: Envelope) -> Arc<Self> {
        let mut responses = HashMap::new();
        responses.insert(format!("{}.{}", provider, tool), envelope);
        Arc::new(StubDispatcher {
            responses,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolDispatcher for StubDispatcher {
    async fn dispatch_tool(
        &self,
        _ctx: &RunContext,
        provider: &str,
        tool: &str,
        payload: Value,
    ) -> Result<Envelope> {
        self.calls
            .lock()
            .unwrap()
            .push((provider.to_string(), tool.to_string(), payload));
        Ok(self
            .responses
            .get(&format!("{}.{}", provider, tool))
            .cloned()
            .unwrap_or_else(|| Envelope::success(json!({"ok": true}))))
    }
}

/// Catalog with an authorized gmail provider.
pub fn gmail_index() -> ToolIndex {
    let mut index = ToolIndex::new();
    index.register(ToolSpec {
        provider: "gmail".into(),
        name: "gmail_search".into(),
        mcp_name: "GMAIL_SEARCH".into(),
        description: "Search emails in the user's Gmail mailbox".into(),
        input_params: vec![
            ParamSpec::required("query", "string"),
            ParamSpec::optional("max_results", "number"),
        ],
        output_schema: json!({
            "messages": [{"messageId": "string", "subject": "string", "from": "string"}],
            "resultSizeEstimate": "number",
        }),
    });
    index.register(ToolSpec {
        provider: "gmail".into(),
        name: "gmail_send_email".into(),
        mcp_name: "GMAIL_SEND_EMAIL".into(),
        description: "Send an email from the user's Gmail account".into(),
        input_params: vec![
            ParamSpec::required("to", "string"),
            ParamSpec::required("subject", "string"),
            ParamSpec::required("body", "string"),
        ],
        output_schema: json!({"id": "string", "threadId": "string"}),
    });
    index.authorize_provider("gmail");
    index
}

/// Build a run context rooted at a temp log directory.
pub fn run_context(logs_dir: &Path) -> RunContext {
    let run_logger = RunLogger::create(logs_dir, "integration test").unwrap();
    let logger = run_logger.agent("orchestrator");
    RunContext {
        run_id: "run-int".into(),
        task_id: "task-int".into(),
        tenant_id: Some("tenant-int".into()),
        request_id: "req-int".into(),
        user_id: "user-int".into(),
        signals: SignalBus::new(),
        stream: Arc::new(StreamBus::new()),
        cost: Arc::new(TokenCostTracker::new()),
        delegation_cost: None,
        llm_requests: Arc::new(foreman::llm::LlmRequestRegistry::new()),
        run_logger,
        logger,
    }
}

/// Temp dir + context pair keeping the log root alive for the test.
pub fn run_context_with_dir() -> (TempDir, RunContext) {
    let dir = TempDir::new().unwrap();
    let ctx = run_context(dir.path());
    (dir, ctx)
}

/// Whether a python interpreter is available for sandbox tests.
pub fn python_available() -> bool {
    which::which("python3").is_ok() || which::which("python").is_ok()
}
