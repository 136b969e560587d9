//! Loopback tool-call bridge for sandbox subprocesses.
//!
//! The generated `sandbox_py.client.call_tool` connects to this listener,
//! sends one JSON line `{provider, tool, payload}`, and reads back one
//! envelope line. The listener lives exactly as long as the sandbox call that
//! started it; dispatch goes through the registered `ToolDispatcher`.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::dispatch::{Envelope, ToolDispatcher};
use crate::error::Result;

#[derive(Debug, Deserialize)]
struct BridgeRequest {
    provider: String,
    tool: String,
    #[serde(default)]
    payload: Value,
}

/// A bound loopback bridge serving tool calls for one sandbox run.
pub struct SandboxBridge {
    port: u16,
    accept_task: JoinHandle<()>,
}

impl SandboxBridge {
    /// Bind an ephemeral loopback port and start serving.
    pub async fn start(ctx: RunContext, dispatcher: Arc<dyn ToolDispatcher>) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        debug!("Sandbox bridge listening on 127.0.0.1:{}", port);

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        let ctx = ctx.clone();
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(socket, &ctx, dispatcher).await {
                                warn!("Sandbox bridge connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Sandbox bridge accept error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(SandboxBridge { port, accept_task })
    }

    /// Port exported to the subprocess as `SANDBOX_BRIDGE_PORT`
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for SandboxBridge {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(
    socket: TcpStream,
    ctx: &RunContext,
    dispatcher: Arc<dyn ToolDispatcher>,
) -> Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Ok(());
    }

    let envelope = match serde_json::from_str::<BridgeRequest>(&line) {
        Ok(request) => dispatcher
            .dispatch_tool(ctx, &request.provider, &request.tool, request.payload)
            .await
            .unwrap_or_else(|e| Envelope::failure(format!("tool dispatch failed: {}", e))),
        Err(e) => Envelope::failure(format!("malformed bridge request: {}", e)),
    };

    let mut response = serde_json::to_string(&envelope)?;
    response.push('\n');
    write_half.write_all(response.as_bytes()).await?;
    write_half.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    struct EchoDispatcher;

    #[async_trait]
    impl ToolDispatcher for EchoDispatcher {
        async fn dispatch_tool(
            &self,
            _ctx: &RunContext,
            provider: &str,
            tool: &str,
            payload: Value,
        ) -> Result<Envelope> {
            Ok(Envelope::success(json!({
                "provider": provider,
                "tool": tool,
                "payload": payload,
            })))
        }
    }

    #[tokio::test]
    async fn test_bridge_round_trip() {
        let dir = tempdir().unwrap();
        let ctx = crate::context::testing::test_context(dir.path());
        let bridge = SandboxBridge::start(ctx, Arc::new(EchoDispatcher)).await.unwrap();

        let mut conn = TcpStream::connect(("127.0.0.1", bridge.port())).await.unwrap();
        let request = json!({
            "provider": "gmail",
            "tool": "gmail_search",
            "payload": {"query": "from:alice"},
        });
        conn.write_all(format!("{}\n", request).as_bytes()).await.unwrap();

        let mut response = String::new();
        conn.read_to_string(&mut response).await.unwrap();
        let envelope: Value = serde_json::from_str(response.trim()).unwrap();
        assert_eq!(envelope["successful"], true);
        assert_eq!(envelope["data"]["tool"], "gmail_search");
        assert_eq!(envelope["data"]["payload"]["query"], "from:alice");
    }

    #[tokio::test]
    async fn test_bridge_malformed_request() {
        let dir = tempdir().unwrap();
        let ctx = crate::context::testing::test_context(dir.path());
        let bridge = SandboxBridge::start(ctx, Arc::new(EchoDispatcher)).await.unwrap();

        let mut conn = TcpStream::connect(("127.0.0.1", bridge.port())).await.unwrap();
        conn.write_all(b"not json\n").await.unwrap();

        let mut response = String::new();
        conn.read_to_string(&mut response).await.unwrap();
        let envelope: Value = serde_json::from_str(response.trim()).unwrap();
        assert_eq!(envelope["successful"], false);
        assert!(envelope["error"].as_str().unwrap().contains("malformed"));
    }
}
