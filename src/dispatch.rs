//! Tool dispatch contract.
//!
//! The core never implements provider actions. It consumes a single
//! `dispatch_tool(provider, tool, payload) → envelope` capability through the
//! `ToolDispatcher` trait; concrete Gmail/Slack/Shopify bindings live outside
//! the crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunContext;
use crate::error::Result;

/// Canonical tool/sandbox response contract.
///
/// All layers read `successful` first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Whether the action succeeded
    pub successful: bool,
    /// Response payload
    #[serde(default)]
    pub data: Value,
    /// Error message when unsuccessful
    #[serde(default)]
    pub error: Option<String>,
    /// Optional provider-side logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Value>,
}

impl Envelope {
    /// Create a successful envelope
    pub fn success(data: Value) -> Self {
        Envelope {
            successful: true,
            data,
            error: None,
            logs: None,
        }
    }

    /// Create a failed envelope
    pub fn failure(error: impl Into<String>) -> Self {
        Envelope {
            successful: false,
            data: Value::Null,
            error: Some(error.into()),
            logs: None,
        }
    }

    /// Render as a JSON value
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Unwrap one level of nested `data` envelope when present.
///
/// Sandbox code sometimes returns a full envelope whose `data` is itself an
/// envelope; observations should see the inner payload.
pub fn unwrap_nested_data(value: Value) -> Value {
    if let Value::Object(ref map) = value {
        if let Some(Value::Object(inner)) = map.get("data") {
            let looks_like_envelope =
                inner.contains_key("successful") && inner.contains_key("data");
            if looks_like_envelope {
                return Value::Object(inner.clone());
            }
        }
    }
    value
}

/// Whether a value looks like a canonical envelope (all three fields present).
pub fn is_envelope(value: &Value) -> bool {
    value
        .as_object()
        .map(|map| {
            map.contains_key("successful") && map.contains_key("data") && map.contains_key("error")
        })
        .unwrap_or(false)
}

/// Capability to invoke a provider action; implementations are external.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Execute a provider tool with a sanitized payload and return its envelope
    async fn dispatch_tool(
        &self,
        ctx: &RunContext,
        provider: &str,
        tool: &str,
        payload: Value,
    ) -> Result<Envelope>;
}
