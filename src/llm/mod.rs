//! Provider-agnostic LLM access.
//!
//! - [`types`]: messages, options, usage, responses
//! - [`backend`]: the `LlmBackend` trait and the OpenAI-compatible HTTP impl
//! - [`registry`]: in-flight request registry for cancel/retry
//! - [`client`]: the facade every call goes through

pub mod backend;
pub mod client;
pub mod registry;
pub mod types;

pub use backend::{HttpBackend, LlmBackend};
pub use client::LlmClient;
pub use registry::{LlmRequestRegistry, RequestEntry};
pub use types::{
    ContentItem, GenerationOptions, LlmRequest, LlmResponse, Message, ReasoningEffort,
    ReasoningSummary, Role, StreamChunk, Usage,
};
