//! Foreman CLI
//!
//! Command-line interface for running tasks and inspecting the catalog.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use foreman::catalog::ToolIndex;
use foreman::config::Config;
use foreman::dispatch::{Envelope, ToolDispatcher};
use foreman::llm::LlmClient;
use foreman::orchestrator::{OrchestratorRequest, OrchestratorRuntime, RunBudget};
use foreman::{RunContext, VERSION};

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "foreman",
    author = "Foreman Contributors",
    version = VERSION,
    about = "Foreman - hierarchical LLM agent runtime",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task through the orchestrator
    Run {
        /// The task to accomplish
        task: String,
        /// Tenant id for the run
        #[arg(long, default_value = "cli")]
        tenant: String,
        /// Maximum outer steps
        #[arg(long)]
        max_steps: Option<u32>,
        /// Maximum run cost in USD
        #[arg(long)]
        max_cost_usd: Option<f64>,
        /// Allow sandboxed code execution
        #[arg(long)]
        allow_code_execution: bool,
    },
    /// Print the effective configuration (secrets redacted)
    Config,
}

/// Dispatcher used when no provider backend is wired in; every tool call
/// reports the missing integration so runs degrade visibly.
struct UnconfiguredDispatcher;

#[async_trait]
impl ToolDispatcher for UnconfiguredDispatcher {
    async fn dispatch_tool(
        &self,
        _ctx: &RunContext,
        provider: &str,
        tool: &str,
        _payload: Value,
    ) -> foreman::Result<Envelope> {
        Ok(Envelope::failure(format!(
            "No tool backend configured for {}.{}; wire a ToolDispatcher into the runtime.",
            provider, tool
        )))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().context("loading configuration")?;
    init_tracing(&config);

    match cli.command {
        Commands::Run {
            task,
            tenant,
            max_steps,
            max_cost_usd,
            allow_code_execution,
        } => {
            config.validate().context("validating configuration")?;

            let llm = Arc::new(LlmClient::from_config(&config.llm)?);
            let index = Arc::new(ToolIndex::new());
            let runtime = OrchestratorRuntime::new(
                &config,
                llm,
                index,
                Arc::new(UnconfiguredDispatcher),
            );

            let mut request = OrchestratorRequest::from_task(&tenant, &task);
            request.allow_code_execution = allow_code_execution;
            request.budget = RunBudget {
                max_steps: max_steps.unwrap_or(15),
                max_cost_usd,
                max_tokens: None,
            };

            info!("Running task: {}", task);
            let state = runtime.run(request).await?;

            println!("steps: {}", state.total_steps());
            for result in &state.results {
                let summary = result
                    .translated()
                    .and_then(|t| t.get("summary"))
                    .and_then(Value::as_str)
                    .unwrap_or("(no summary)");
                println!(
                    "  [{}] {} {}: {}",
                    if result.success { "ok" } else { "failed" },
                    result.target,
                    result.next_task,
                    summary
                );
            }
            if let Some(status) = state.intermediate.get("completion_status") {
                println!("completion_status: {}", status);
            }
        }
        Commands::Config => {
            println!("llm.base_url: {}", config.llm.base_url);
            println!("llm.default_model: {}", config.llm.default_model);
            println!("llm.request_timeout_secs: {}", config.llm.request_timeout_secs);
            println!("sandbox.timeout_secs: {}", config.sandbox.timeout_secs);
            println!("runtime.max_concurrency: {}", config.runtime.max_concurrency);
            println!("runtime.logs_dir: {}", config.runtime.logs_dir.display());
        }
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    if config.log.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
