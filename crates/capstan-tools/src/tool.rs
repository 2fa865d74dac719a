// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use capstan_model::ToolResultContent;

use crate::hooks::HookRegistry;
use crate::subprocess::SubprocessRuntime;

/// Default per-call ceiling applied by the registry.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// The result of executing a tool: content for the model plus a failure
/// flag.  Failures are data, not exceptions — the model sees them and can
/// recover.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: ToolResultContent,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: ToolResultContent::Text(content.into()),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: ToolResultContent::Text(message.into()),
            is_error: true,
        }
    }

    pub fn with_content(content: ToolResultContent) -> Self {
        Self {
            content,
            is_error: false,
        }
    }
}

/// Per-call context handed to every tool.
///
/// The subprocess runtime is reached through here rather than through a
/// module-level global, so independent agent loops can share (or isolate)
/// their process tables explicitly.
#[derive(Clone)]
pub struct ToolCtx {
    pub working_dir: PathBuf,
    pub session_id: String,
    /// Environment overlay applied on top of the inherited environment for
    /// spawned processes.
    pub env: HashMap<String, String>,
    pub hooks: Arc<HookRegistry>,
    pub runtime: Arc<SubprocessRuntime>,
    /// Cancellation for this call; the registry hands each call a child of
    /// the loop token so either side can abort.
    pub cancel: CancellationToken,
}

impl ToolCtx {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        session_id: impl Into<String>,
        hooks: Arc<HookRegistry>,
        runtime: Arc<SubprocessRuntime>,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            session_id: session_id.into(),
            env: HashMap::new(),
            hooks,
            runtime,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Trait every tool implements.
///
/// `execute` errors are converted by the loop into `is_error` tool results;
/// return `Ok(ToolResult::error(..))` for failures the model should read
/// verbatim, and `Err` for genuinely exceptional conditions.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object.
    fn input_schema(&self) -> Value;
    /// Hard ceiling for this tool's execution, clamping any caller override.
    fn max_timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }
    async fn execute(&self, input: Value, ctx: &ToolCtx) -> anyhow::Result<ToolResult>;
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_is_not_error() {
        let r = ToolResult::ok("fine");
        assert!(!r.is_error);
        assert_eq!(r.content.to_text(), "fine");
    }

    #[test]
    fn error_result_sets_flag() {
        let r = ToolResult::error("boom");
        assert!(r.is_error);
        assert_eq!(r.content.to_text(), "boom");
    }

    #[test]
    fn ctx_child_cancel_follows_parent() {
        let hooks = Arc::new(HookRegistry::new());
        let runtime = Arc::new(SubprocessRuntime::new());
        let ctx = ToolCtx::new("/tmp", "sess", hooks, runtime);
        let child = ctx.cancel.child_token();
        ctx.cancel.cancel();
        assert!(child.is_cancelled());
    }
}
