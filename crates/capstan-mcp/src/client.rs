// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP client: newline-delimited JSON-RPC 2.0 with request correlation.
//!
//! The client is transport-generic over an `AsyncWrite`/`AsyncRead` pair —
//! child stdio in production, an in-memory duplex in tests.  A reader task
//! owns the correlation table: inbound lines are matched to pending
//! requests by id; notifications and noise are skipped; EOF rejects every
//! pending request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::{
    initialize_params, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpToolDef,
    ToolCallResult, ToolsListResult,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP server '{0}' is unavailable")]
    ServerUnavailable(String),
    #[error("MCP request '{method}' timed out after {after:?}")]
    RequestTimeout { method: String, after: Duration },
    #[error("MCP tool call failed ({code}): {message}")]
    CallError { code: i64, message: String },
    #[error("MCP server exited")]
    ServerExited,
    #[error("MCP protocol violation: {0}")]
    Protocol(String),
    #[error("MCP transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct McpClient {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    request_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl McpClient {
    /// Wrap a transport pair and start the reader task.
    pub fn new(
        writer: impl AsyncWrite + Send + Unpin + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
        request_timeout: Duration,
    ) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_pending = Arc::clone(&pending);
        let reader_alive = Arc::clone(&alive);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        // Misconfigured servers log to stdout; skip anything
                        // that is not a JSON object.
                        if !trimmed.starts_with('{') {
                            debug!(line = %trimmed, "skipping non-JSON line from MCP server");
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                            Ok(resp) => {
                                let sender =
                                    reader_pending.lock().expect("pending map poisoned").remove(&resp.id);
                                match sender {
                                    Some(tx) => {
                                        let _ = tx.send(resp);
                                    }
                                    None => {
                                        debug!(id = resp.id, "response for unknown request id")
                                    }
                                }
                            }
                            // Notifications have no id and fail to parse as
                            // responses; they carry nothing we consume.
                            Err(_) => debug!(line = %trimmed, "skipping non-response frame"),
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            // Dropping the senders rejects every pending request.
            reader_pending.lock().expect("pending map poisoned").clear();
        });

        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(0),
            alive,
            request_timeout,
            reader_task,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn write_line(&self, json: &str) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send one request and wait for its correlated response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        if !self.is_alive() {
            return Err(McpError::ServerExited);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, tx);

        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| McpError::Protocol(format!("serializing request: {e}")))?;
        debug!(id, method, "sending MCP request");
        if let Err(e) = self.write_line(&frame).await {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&id);
                Err(McpError::RequestTimeout {
                    method: method.to_string(),
                    after: self.request_timeout,
                })
            }
            Ok(Err(_)) => Err(McpError::ServerExited),
            Ok(Ok(resp)) => Ok(resp),
        }
    }

    pub async fn notify(&self, method: &str) -> Result<(), McpError> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method))
            .map_err(|e| McpError::Protocol(format!("serializing notification: {e}")))?;
        debug!(method, "sending MCP notification");
        self.write_line(&frame).await
    }

    /// The MCP handshake: `initialize` then `notifications/initialized`.
    /// No other method may be sent before this completes.
    pub async fn initialize(&self) -> Result<(), McpError> {
        let params = serde_json::to_value(initialize_params())
            .map_err(|e| McpError::Protocol(format!("serializing initialize params: {e}")))?;
        let resp = self.request("initialize", Some(params)).await?;
        if let Some(err) = resp.error {
            return Err(McpError::Protocol(format!("initialize failed: {err}")));
        }
        self.notify("notifications/initialized").await
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        let resp = self.request("tools/list", None).await?;
        if let Some(err) = resp.error {
            return Err(McpError::Protocol(format!("tools/list failed: {err}")));
        }
        let result: ToolsListResult =
            serde_json::from_value(resp.result.unwrap_or(Value::Null))
                .map_err(|e| McpError::Protocol(format!("parsing tools/list result: {e}")))?;
        Ok(result.tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let resp = self.request("tools/call", Some(params)).await?;
        if let Some(err) = resp.error {
            return Err(McpError::CallError {
                code: err.code,
                message: err.message,
            });
        }
        serde_json::from_value(resp.result.unwrap_or(Value::Null))
            .map_err(|e| McpError::Protocol(format!("parsing tools/call result: {e}")))
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        let resp = self.request("ping", None).await?;
        match resp.error {
            Some(err) => Err(McpError::Protocol(format!("ping failed: {err}"))),
            None => Ok(()),
        }
    }

    /// Graceful shutdown request; the caller kills the process afterwards.
    pub async fn shutdown(&self) -> Result<(), McpError> {
        let resp = self.request("shutdown", None).await?;
        match resp.error {
            Some(err) => Err(McpError::Protocol(format!("shutdown failed: {err}"))),
            None => Ok(()),
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
