//! Provider-agnostic LLM facade.
//!
//! Every LLM call in the runtime goes through `LlmClient`. It owns backend
//! routing (primary, fallback, image-content override), retry with
//! exponential backoff on retryable errors, run-scoped cancellation polling,
//! cost accounting, and per-call JSONL logging.

use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::llm::backend::{HttpBackend, LlmBackend};
use crate::llm::registry::RequestEntry;
use crate::llm::types::{LlmRequest, LlmResponse, StreamChunk};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Single entry point for every LLM call.
pub struct LlmClient {
    primary: Arc<dyn LlmBackend>,
    fallback: Option<Arc<dyn LlmBackend>>,
    image: Option<Arc<dyn LlmBackend>>,
    default_model: String,
    fallback_model: Option<String>,
    image_model: Option<String>,
    request_timeout: Duration,
    max_retries: u32,
}

impl LlmClient {
    /// Create a facade over a single backend
    pub fn new(primary: Arc<dyn LlmBackend>, default_model: impl Into<String>) -> Self {
        LlmClient {
            primary,
            fallback: None,
            image: None,
            default_model: default_model.into(),
            fallback_model: None,
            image_model: None,
            request_timeout: Duration::from_secs(600),
            max_retries: 3,
        }
    }

    /// Build HTTP backends from configuration
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let primary: Arc<dyn LlmBackend> = Arc::new(HttpBackend::new(
            "primary",
            config.base_url.clone(),
            &config.api_key,
        )?);
        let mut client = LlmClient::new(primary, config.default_model.clone());
        client.request_timeout = Duration::from_secs(config.request_timeout_secs);
        client.max_retries = config.max_retries;
        client.fallback_model = config.fallback_model.clone();
        client.image_model = config.image_model.clone();
        if config.fallback_model.is_some() {
            client.fallback = Some(Arc::new(HttpBackend::new(
                "fallback",
                config.base_url.clone(),
                &config.api_key,
            )?));
        }
        if config.image_model.is_some() {
            client.image = Some(Arc::new(HttpBackend::new(
                "image",
                config.base_url.clone(),
                &config.api_key,
            )?));
        }
        Ok(client)
    }

    /// Add a fallback backend used after a failed primary call
    pub fn with_fallback(mut self, backend: Arc<dyn LlmBackend>, model: Option<String>) -> Self {
        self.fallback = Some(backend);
        self.fallback_model = model;
        self
    }

    /// Add a backend handling requests that carry image content
    pub fn with_image_backend(mut self, backend: Arc<dyn LlmBackend>, model: Option<String>) -> Self {
        self.image = Some(backend);
        self.image_model = model;
        self
    }

    /// Default model identifier
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Generate a completion.
    ///
    /// The call is registered in the run's request registry and polled every
    /// second for a cancel signal; a retry signal restarts it transparently.
    /// Usage is recorded against the cost tracker and one JSONL record is
    /// written per call.
    pub async fn generate(
        &self,
        ctx: &RunContext,
        label: &str,
        mut request: LlmRequest,
    ) -> Result<LlmResponse> {
        let (backend, route_reason) = self.route(&request);
        if route_reason == "image_content" {
            if let Some(ref model) = self.image_model {
                request.model = model.clone();
            }
        }

        let entry = ctx
            .llm_requests
            .register(&ctx.run_id, backend.name(), &request.model);
        let started = Instant::now();

        let mut result = self
            .generate_watched(Arc::clone(&backend), &request, &entry)
            .await;

        // One fallback pass after a non-cancellation failure.
        let mut used_backend = backend.name().to_string();
        let mut reason = route_reason;
        if let Err(ref error) = result {
            if !error.is_cancelled() && !error.is_client_error() {
                if let Some(ref fallback) = self.fallback {
                    warn!(
                        "Primary LLM backend failed ({}); retrying on fallback",
                        error
                    );
                    let mut retry_request = request.clone();
                    if let Some(ref model) = self.fallback_model {
                        retry_request.model = model.clone();
                    }
                    result = self
                        .generate_watched(Arc::clone(fallback), &retry_request, &entry)
                        .await;
                    used_backend = fallback.name().to_string();
                    reason = "fallback_after_error";
                }
            }
        }

        ctx.llm_requests.clear(&ctx.run_id, &entry.request_id);

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => {
                let cost = ctx.record_llm_usage(&response.model, label, &response.usage);
                ctx.logger.log_event(
                    "llm.completed",
                    json!({
                        "label": label,
                        "backend": used_backend,
                        "model": response.model,
                        "route_reason": reason,
                        "duration_ms": duration_ms,
                        "output_chars": response.text.len(),
                        "tokens": {
                            "input_cached": response.usage.cached_input_tokens,
                            "input_new": response.usage.new_input_tokens,
                            "output": response.usage.output_tokens,
                        },
                        "cost_usd": cost,
                    }),
                );
            }
            Err(error) => {
                ctx.logger.log_event(
                    "llm.failed",
                    json!({
                        "label": label,
                        "backend": used_backend,
                        "model": request.model,
                        "route_reason": reason,
                        "duration_ms": duration_ms,
                        "error": error.to_string(),
                    }),
                );
            }
        }

        result
    }

    /// Generate with a streaming callback.
    ///
    /// Backends without token streams deliver the completed text as a single
    /// terminal chunk; cancellation and accounting behave as in `generate`.
    pub async fn generate_streaming<F>(
        &self,
        ctx: &RunContext,
        label: &str,
        request: LlmRequest,
        mut on_chunk: F,
    ) -> Result<LlmResponse>
    where
        F: FnMut(StreamChunk) + Send,
    {
        let response = self.generate(ctx, label, request).await?;
        on_chunk(StreamChunk {
            delta: response.text.clone(),
        });
        Ok(response)
    }

    fn route(&self, request: &LlmRequest) -> (Arc<dyn LlmBackend>, &'static str) {
        if request.has_image_content() {
            if let Some(ref image) = self.image {
                return (Arc::clone(image), "image_content");
            }
        }
        (Arc::clone(&self.primary), "primary")
    }

    /// Run one backend call under the 1 s cancel poll.
    async fn generate_watched(
        &self,
        backend: Arc<dyn LlmBackend>,
        request: &LlmRequest,
        entry: &RequestEntry,
    ) -> Result<LlmResponse> {
        'attempt: loop {
            let fut = self.generate_with_retries(Arc::clone(&backend), request);
            tokio::pin!(fut);
            let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
            poll.tick().await; // first tick fires immediately

            loop {
                tokio::select! {
                    result = &mut fut => return result,
                    _ = poll.tick() => {
                        if entry.cancel_requested() {
                            if entry.take_retry() {
                                debug!("LLM request restart requested for run {}", entry.run_id);
                                continue 'attempt;
                            }
                            return Err(Error::Cancelled("llm request cancelled".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// One logical call with exponential backoff across retryable failures.
    async fn generate_with_retries(
        &self,
        backend: Arc<dyn LlmBackend>,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let attempts = AtomicU32::new(0);
        let policy = backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };

        backoff::future::retry(policy, || {
            let backend = Arc::clone(&backend);
            let attempts = &attempts;
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let outcome =
                    tokio::time::timeout(self.request_timeout, backend.generate(request)).await;
                match outcome {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(error)) if error.is_retryable() && attempt < self.max_retries => {
                        warn!(
                            "LLM call failed (attempt {}/{}): {}",
                            attempt + 1,
                            self.max_retries + 1,
                            error
                        );
                        Err(backoff::Error::transient(error))
                    }
                    Ok(Err(error)) => Err(backoff::Error::permanent(error)),
                    Err(_) if attempt < self.max_retries => {
                        Err(backoff::Error::transient(Error::Timeout(format!(
                            "LLM request timed out after {:?}",
                            self.request_timeout
                        ))))
                    }
                    Err(_) => Err(backoff::Error::permanent(Error::Timeout(format!(
                        "LLM request timed out after {:?}",
                        self.request_timeout
                    )))),
                }
            }
        })
        .await
    }
}
