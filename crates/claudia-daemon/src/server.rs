//! Line-delimited tool server.
//!
//! One JSON request per line on stdin, one JSON response per line on
//! stdout; logging goes to stderr. Requests are processed in receive order
//! per connection. Handler panics are trapped and surfaced as internal
//! storage errors rather than taking the daemon down.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::protocol::{ToolRequest, ToolResponse};
use crate::scheduler::SchedulerStatus;
use crate::tools;

/// Tool server over any line-oriented transport
pub struct ToolServer {
    ctx: Arc<AppContext>,
    scheduler: SchedulerStatus,
}

impl ToolServer {
    pub fn new(ctx: Arc<AppContext>, scheduler: SchedulerStatus) -> Self {
        Self { ctx, scheduler }
    }

    /// Run over stdin/stdout until EOF or shutdown.
    pub async fn run_stdio(&self, shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let reader = BufReader::new(tokio::io::stdin());
        let writer = tokio::io::stdout();
        self.run(reader, writer, shutdown).await
    }

    /// Run over an arbitrary reader/writer pair. New requests stop being
    /// accepted once `shutdown` flips; the request already in flight
    /// finishes first (drain).
    pub async fn run<R, W>(
        &self,
        reader: R,
        mut writer: W,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        info!("tool server ready");

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = shutdown.changed() => {
                    info!("tool server stopping: shutdown signal");
                    break;
                }
            };
            let Some(line) = line else {
                info!("tool server stopping: end of input");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            debug!("request: {} bytes", line.len());

            let response = self.handle_line(&line).await;
            let payload = serde_json::to_string(&response).unwrap_or_else(|e| {
                warn!("failed to serialize response: {}", e);
                r#"{"id":null,"ok":false,"error":{"kind":"StorageError","message":"internal: unserializable response"}}"#
                    .to_string()
            });
            writer.write_all(payload.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        writer.flush().await?;
        Ok(())
    }

    /// Parse and dispatch one request line.
    pub async fn handle_line(&self, line: &str) -> ToolResponse {
        let request: ToolRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                // Salvage the caller's id when the envelope is readable
                let id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").cloned())
                    .unwrap_or(Value::Null);
                return ToolResponse::failure(id, "InvalidInput", format!("bad request: {}", e));
            }
        };

        let id = request.id.clone();
        let ctx = self.ctx.clone();
        let scheduler = self.scheduler.clone();
        let tool = request.tool.clone();
        let args = request.args;

        // Spawned so a panicking handler is trapped by the join handle
        let handle =
            tokio::spawn(async move { tools::dispatch(&ctx, &scheduler, &tool, args).await });

        match handle.await {
            Ok(Ok(result)) => ToolResponse::success(id, result),
            Ok(Err(e)) => {
                debug!("tool '{}' failed: {}", request.tool, e);
                ToolResponse::from_error(id, &e)
            }
            Err(join_error) => {
                warn!("tool '{}' panicked: {}", request.tool, join_error);
                ToolResponse::failure(id, "StorageError", "internal: handler panicked")
            }
        }
    }
}
