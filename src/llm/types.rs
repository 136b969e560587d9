//! Type definitions for the LLM facade

use serde::{Deserialize, Serialize};

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing context and instructions
    System,
    /// Developer message carrying structured state
    Developer,
    /// User message
    User,
    /// Assistant (AI) response
    Assistant,
    /// Tool/function result
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::Developer => write!(f, "developer"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// One content item inside a message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    /// Plain text content
    Text {
        /// The text body
        text: String,
    },
    /// Image reference (URL or data URI)
    ImageUrl {
        /// Image location
        url: String,
    },
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Content items; most messages carry a single text item
    pub content: Vec<ContentItem>,
}

impl Message {
    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: vec![ContentItem::Text {
                text: content.into(),
            }],
        }
    }

    /// Create a new developer message
    pub fn developer(content: impl Into<String>) -> Self {
        Message {
            role: Role::Developer,
            content: vec![ContentItem::Text {
                text: content.into(),
            }],
        }
    }

    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: vec![ContentItem::Text {
                text: content.into(),
            }],
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: vec![ContentItem::Text {
                text: content.into(),
            }],
        }
    }

    /// Create a user message carrying text plus an image
    pub fn user_with_image(text: impl Into<String>, image_url: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: vec![
                ContentItem::Text { text: text.into() },
                ContentItem::ImageUrl {
                    url: image_url.into(),
                },
            ],
        }
    }

    /// Whether this message carries any image content
    pub fn has_image(&self) -> bool {
        self.content
            .iter()
            .any(|item| matches!(item, ContentItem::ImageUrl { .. }))
    }

    /// Concatenated text content of this message
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(text.as_str()),
                ContentItem::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Reasoning effort requested from reasoning-capable models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Reasoning summary verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningSummary {
    Auto,
    Concise,
    Detailed,
    None,
}

/// Generation options for completions
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    /// Maximum tokens to generate
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Reasoning effort hint
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Reasoning summary verbosity
    pub reasoning_summary: Option<ReasoningSummary>,
    /// Force a JSON object response
    pub json_mode: bool,
    /// Stop sequences
    pub stop: Option<Vec<String>>,
}

impl GenerationOptions {
    /// Options for JSON-mode structured output
    pub fn json() -> Self {
        GenerationOptions {
            json_mode: true,
            ..Default::default()
        }
    }

    /// Options for precise, deterministic output
    pub fn precise() -> Self {
        GenerationOptions {
            temperature: Some(0.0),
            ..Default::default()
        }
    }

    /// Set the output token ceiling
    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    /// Set the reasoning effort
    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }
}

/// A complete request handed to a backend
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Model identifier
    pub model: String,
    /// Conversation messages
    pub messages: Vec<Message>,
    /// Generation options
    pub options: GenerationOptions,
}

impl LlmRequest {
    /// Whether any message carries image content
    pub fn has_image_content(&self) -> bool {
        self.messages.iter().any(Message::has_image)
    }
}

/// Token usage for one completion
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    /// Prompt tokens served from cache
    pub cached_input_tokens: u64,
    /// Prompt tokens billed as new input
    pub new_input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
}

impl Usage {
    /// Total tokens across all categories
    pub fn total(&self) -> u64 {
        self.cached_input_tokens + self.new_input_tokens + self.output_tokens
    }
}

/// Response from a backend
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Assistant text output
    pub text: String,
    /// Model that produced the completion
    pub model: String,
    /// Token usage
    pub usage: Usage,
}

/// One streaming chunk delivered to a streaming callback
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// Incremental text delta
    pub delta: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = Message::system("hello");
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.text(), "hello");
        assert!(!msg.has_image());

        let img = Message::user_with_image("look", "https://example.com/a.png");
        assert!(img.has_image());
        assert_eq!(img.text(), "look");
    }

    #[test]
    fn test_request_image_detection() {
        let request = LlmRequest {
            model: "m".into(),
            messages: vec![Message::user("plain")],
            options: GenerationOptions::default(),
        };
        assert!(!request.has_image_content());

        let request = LlmRequest {
            model: "m".into(),
            messages: vec![Message::user_with_image("x", "u")],
            options: GenerationOptions::default(),
        };
        assert!(request.has_image_content());
    }

    #[test]
    fn test_usage_total() {
        let usage = Usage {
            cached_input_tokens: 10,
            new_input_tokens: 20,
            output_tokens: 5,
        };
        assert_eq!(usage.total(), 35);
    }
}
