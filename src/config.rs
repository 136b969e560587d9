//! Configuration management for Foreman
//!
//! Loads configuration from environment variables.

use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;

/// LLM facade configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API key for the primary provider
    pub api_key: SecretString,
    /// Base URL of the OpenAI-compatible endpoint
    pub base_url: String,
    /// Default model for planner/orchestrator calls
    pub default_model: String,
    /// Optional fallback model used when the primary backend errors out
    pub fallback_model: Option<String>,
    /// Optional model override for requests carrying image content
    pub image_model: Option<String>,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Maximum retry attempts on retryable errors
    pub max_retries: u32,
}

/// Sandbox/execution configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Python interpreter path; discovered from PATH when unset
    pub python: Option<PathBuf>,
    /// Execution timeout per sandbox call in seconds
    pub timeout_secs: u64,
    /// Optional directory receiving a snapshot of each generated plan
    pub debug_dir: Option<PathBuf>,
}

/// Runtime-level configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum concurrent runs
    pub max_concurrency: usize,
    /// Root directory for per-run hierarchical logs
    pub logs_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter
    pub level: String,
    /// Log format (pretty, json)
    pub format: String,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// LLM facade settings
    pub llm: LlmConfig,
    /// Sandbox settings
    pub sandbox: SandboxConfig,
    /// Runtime settings
    pub runtime: RuntimeConfig,
    /// Logging settings
    pub log: LogConfig,
}

fn default_logs_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("foreman").join("logs"))
        .unwrap_or_else(|| PathBuf::from("./logs"))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Ok(Config {
            llm: LlmConfig {
                api_key: SecretString::from(std::env::var("FOREMAN_API_KEY")?),
                base_url: std::env::var("FOREMAN_LLM_BASE_URL")
                    .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
                default_model: std::env::var("FOREMAN_MODEL")
                    .unwrap_or_else(|_| "openai/o4-mini".to_string()),
                fallback_model: std::env::var("FOREMAN_FALLBACK_MODEL").ok(),
                image_model: std::env::var("FOREMAN_IMAGE_MODEL").ok(),
                request_timeout_secs: std::env::var("FOREMAN_LLM_TIMEOUT")
                    .unwrap_or_else(|_| "600".to_string())
                    .parse()
                    .unwrap_or(600),
                max_retries: std::env::var("FOREMAN_LLM_MAX_RETRIES")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
            },
            sandbox: SandboxConfig {
                python: std::env::var("FOREMAN_PYTHON").ok().map(PathBuf::from),
                timeout_secs: std::env::var("FOREMAN_SANDBOX_TIMEOUT")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
                debug_dir: std::env::var("FOREMAN_SANDBOX_DEBUG_DIR")
                    .ok()
                    .map(PathBuf::from),
            },
            runtime: RuntimeConfig {
                max_concurrency: std::env::var("FOREMAN_MAX_CONCURRENCY")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse()
                    .unwrap_or(4),
                logs_dir: std::env::var("FOREMAN_LOGS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| default_logs_dir()),
            },
            log: LogConfig {
                level: std::env::var("RUST_LOG")
                    .unwrap_or_else(|_| "info,foreman=debug".to_string()),
                format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            },
        })
    }

    /// Create a minimal config for testing or commands that don't need full config
    pub fn minimal() -> Self {
        Config {
            llm: LlmConfig {
                api_key: SecretString::from(""),
                base_url: "https://openrouter.ai/api/v1".to_string(),
                default_model: "openai/o4-mini".to_string(),
                fallback_model: None,
                image_model: None,
                request_timeout_secs: 600,
                max_retries: 3,
            },
            sandbox: SandboxConfig {
                python: None,
                timeout_secs: 30,
                debug_dir: None,
            },
            runtime: RuntimeConfig {
                max_concurrency: 4,
                logs_dir: PathBuf::from("./logs"),
            },
            log: LogConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    /// Validate that all required configuration is present
    pub fn validate(&self) -> Result<()> {
        if self.llm.api_key.expose_secret().is_empty() {
            return Err(Error::Config("FOREMAN_API_KEY is required".to_string()));
        }
        if self.runtime.max_concurrency == 0 {
            return Err(Error::Config(
                "FOREMAN_MAX_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config = Config::minimal();
        assert!(config.validate().is_err()); // Missing API key
        assert_eq!(config.sandbox.timeout_secs, 30);
        assert_eq!(config.runtime.max_concurrency, 4);
    }
}
