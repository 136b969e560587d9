//! LLM backend trait and the OpenAI-compatible HTTP implementation.

use async_trait::async_trait;
use reqwest::{header, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::types::{ContentItem, LlmRequest, LlmResponse, Usage};

/// A provider capable of serving completions
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend name used in routing decisions and logs
    fn name(&self) -> &str;

    /// Generate a completion for the request
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse>;
}

/// OpenAI-compatible chat-completions backend
pub struct HttpBackend {
    name: String,
    client: Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a new HTTP backend
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: &SecretString,
    ) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", api_key.expose_secret()))
                .map_err(|e| Error::Config(format!("Invalid API key format: {}", e)))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(600))
            .build()?;

        Ok(HttpBackend {
            name: name.into(),
            client,
            base_url: base_url.into(),
        })
    }

    fn build_body(&self, request: &LlmRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|message| {
                // Single text item collapses to a plain string; anything else
                // (image content) uses the array form.
                let content = match message.content.as_slice() {
                    [ContentItem::Text { text }] => json!(text),
                    items => json!(items
                        .iter()
                        .map(|item| match item {
                            ContentItem::Text { text } => json!({"type": "text", "text": text}),
                            ContentItem::ImageUrl { url } => {
                                json!({"type": "image_url", "image_url": {"url": url}})
                            }
                        })
                        .collect::<Vec<_>>()),
                };
                json!({"role": message.role.to_string(), "content": content})
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": false,
        });
        let options = &request.options;
        if let Some(max) = options.max_output_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(temp) = options.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(effort) = options.reasoning_effort {
            body["reasoning_effort"] = serde_json::to_value(effort).unwrap_or(Value::Null);
        }
        if let Some(ref stop) = options.stop {
            body["stop"] = json!(stop);
        }
        if options.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[async_trait]
impl LlmBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!("Sending LLM request: backend={} model={}", self.name, request.model);

        let response = self
            .client
            .post(&url)
            .json(&self.build_body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => Error::RateLimit(error_text),
                401 => Error::Unauthorized("Invalid API key".to_string()),
                408 | 504 => Error::Timeout(error_text),
                _ => Error::Llm(format!("API error ({}): {}", status, error_text)),
            });
        }

        let body: ChatResponse = response.json().await?;
        let text = body
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        let usage = body
            .usage
            .map(|u| {
                let cached = u
                    .prompt_tokens_details
                    .map(|d| d.cached_tokens)
                    .unwrap_or(0);
                Usage {
                    cached_input_tokens: cached,
                    new_input_tokens: u.prompt_tokens.saturating_sub(cached),
                    output_tokens: u.completion_tokens,
                }
            })
            .unwrap_or_default();

        Ok(LlmResponse {
            text,
            model: body.model.unwrap_or_else(|| request.model.clone()),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{GenerationOptions, Message};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(model: &str, json_mode: bool) -> LlmRequest {
        LlmRequest {
            model: model.to_string(),
            messages: vec![Message::system("be brief"), Message::user("hi")],
            options: GenerationOptions {
                json_mode,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_build_body_shapes() {
        let backend =
            HttpBackend::new("primary", "https://example.test/v1", &SecretString::from("k"))
                .unwrap();
        let body = backend.build_body(&request("model-a", true));
        assert_eq!(body["model"], "model-a");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_build_body_image_content() {
        let backend =
            HttpBackend::new("image", "https://example.test/v1", &SecretString::from("k"))
                .unwrap();
        let req = LlmRequest {
            model: "vision".into(),
            messages: vec![Message::user_with_image("describe", "https://x/y.png")],
            options: GenerationOptions::default(),
        };
        let body = backend.build_body(&req);
        let content = &body["messages"][0]["content"];
        assert!(content.is_array());
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["image_url"]["url"], "https://x/y.png");
    }

    #[tokio::test]
    async fn test_generate_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "model-a",
                "choices": [{"message": {"role": "assistant", "content": "hello"}}],
                "usage": {
                    "prompt_tokens": 100,
                    "completion_tokens": 20,
                    "prompt_tokens_details": {"cached_tokens": 40},
                },
            })))
            .mount(&server)
            .await;

        let backend =
            HttpBackend::new("primary", server.uri(), &SecretString::from("key")).unwrap();
        let response = backend.generate(&request("model-a", false)).await.unwrap();
        assert_eq!(response.text, "hello");
        assert_eq!(response.usage.cached_input_tokens, 40);
        assert_eq!(response.usage.new_input_tokens, 60);
        assert_eq!(response.usage.output_tokens, 20);
    }

    #[tokio::test]
    async fn test_generate_maps_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let backend =
            HttpBackend::new("primary", server.uri(), &SecretString::from("key")).unwrap();
        let err = backend.generate(&request("model-a", false)).await.unwrap_err();
        assert!(matches!(err, Error::RateLimit(_)));
        assert!(err.is_retryable());
    }
}
