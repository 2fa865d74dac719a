// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use capstan_model::ToolDefinition;

use crate::tool::{Tool, ToolCtx, ToolResult, DEFAULT_TOOL_TIMEOUT};

/// Typed dispatch failures.  Tool-thrown errors are wrapped in `Execute` so
/// the loop can turn any variant into an `is_error` tool result uniformly.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("tool {name} timed out after {after:?}")]
    Timeout { name: String, after: Duration },
    #[error("tool {name} was cancelled")]
    Cancelled { name: String },
    #[error("tool {name} failed: {source}")]
    Execute {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Central name→tool map.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// A new registry containing only the named tools; unknown names are
    /// ignored.  Used when a worker is given a tool subset.
    pub fn subset(&self, names: &[String]) -> ToolRegistry {
        let tools = self
            .tools
            .iter()
            .filter(|(name, _)| names.iter().any(|n| n == *name))
            .map(|(name, tool)| (name.clone(), Arc::clone(tool)))
            .collect();
        ToolRegistry { tools }
    }

    /// Definitions for every registered tool, sorted by name for a stable
    /// request body.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute one tool call with a fresh child cancellation token and a
    /// timeout race.  The effective timeout is the caller override (or the
    /// default), clamped to the tool's own ceiling.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: &ToolCtx,
        timeout_override: Option<Duration>,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let timeout = timeout_override
            .unwrap_or(DEFAULT_TOOL_TIMEOUT)
            .min(tool.max_timeout());

        // Either abort propagates: the caller token cancels the child, and a
        // timeout cancels the child so the tool's own spawns die with it.
        let call_cancel = ctx.cancel.child_token();
        let call_ctx = ctx.clone().with_cancel(call_cancel.clone());

        tokio::select! {
            biased;
            _ = call_cancel.cancelled() => Err(ToolError::Cancelled {
                name: name.to_string(),
            }),
            result = tool.execute(input, &call_ctx) => {
                result.map_err(|source| ToolError::Execute {
                    name: name.to_string(),
                    source,
                })
            }
            _ = tokio::time::sleep(timeout) => {
                call_cancel.cancel();
                Err(ToolError::Timeout {
                    name: name.to_string(),
                    after: timeout,
                })
            }
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::hooks::HookRegistry;
    use crate::subprocess::SubprocessRuntime;

    fn ctx() -> ToolCtx {
        ToolCtx::new(
            "/tmp",
            "sess-1",
            Arc::new(HookRegistry::new()),
            Arc::new(SubprocessRuntime::new()),
        )
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, input: Value, _ctx: &ToolCtx) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::ok(format!("echo:{input}")))
        }
    }

    struct NeverTool;

    #[async_trait]
    impl Tool for NeverTool {
        fn name(&self) -> &str {
            "never"
        }
        fn description(&self) -> &str {
            "never returns"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _input: Value, _ctx: &ToolCtx) -> anyhow::Result<ToolResult> {
            futures_never().await
        }
    }

    async fn futures_never() -> anyhow::Result<ToolResult> {
        std::future::pending::<()>().await;
        unreachable!()
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "failing"
        }
        fn description(&self) -> &str {
            "always throws"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _input: Value, _ctx: &ToolCtx) -> anyhow::Result<ToolResult> {
            anyhow::bail!("disk on fire")
        }
    }

    // ── Lookup and definitions ────────────────────────────────────────────────

    #[tokio::test]
    async fn execute_known_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        let out = reg
            .execute("echo", json!({"x": 1}), &ctx(), None)
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.content.to_text().starts_with("echo:"));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let reg = ToolRegistry::new();
        let err = reg.execute("missing", json!({}), &ctx(), None).await;
        assert!(matches!(err, Err(ToolError::NotFound(name)) if name == "missing"));
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(NeverTool);
        reg.register(EchoTool);
        let defs = reg.definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "never"]);
    }

    #[test]
    fn subset_filters_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(NeverTool);
        let sub = reg.subset(&["echo".to_string(), "ghost".to_string()]);
        assert_eq!(sub.names(), vec!["echo"]);
    }

    // ── Timeout and cancellation ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_at_configured_value() {
        let mut reg = ToolRegistry::new();
        reg.register(NeverTool);
        let configured = Duration::from_millis(250);
        let started = tokio::time::Instant::now();
        let err = reg
            .execute("never", json!({}), &ctx(), Some(configured))
            .await;
        let elapsed = started.elapsed();
        assert!(matches!(
            err,
            Err(ToolError::Timeout { after, .. }) if after == configured
        ));
        // With paused time the race is deterministic: [T, T + 50ms].
        assert!(elapsed >= configured);
        assert!(elapsed <= configured + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn caller_cancellation_aborts_the_call() {
        let mut reg = ToolRegistry::new();
        reg.register(NeverTool);
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = reg.execute("never", json!({}), &ctx, None).await;
        assert!(matches!(err, Err(ToolError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn tool_exception_wrapped_as_execute_error() {
        let mut reg = ToolRegistry::new();
        reg.register(FailingTool);
        let err = reg.execute("failing", json!({}), &ctx(), None).await;
        match err {
            Err(ToolError::Execute { name, source }) => {
                assert_eq!(name, "failing");
                assert!(source.to_string().contains("disk on fire"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_is_clamped_to_tool_ceiling() {
        struct TinyCeiling;
        #[async_trait]
        impl Tool for TinyCeiling {
            fn name(&self) -> &str {
                "tiny"
            }
            fn description(&self) -> &str {
                "short ceiling"
            }
            fn input_schema(&self) -> Value {
                json!({"type": "object"})
            }
            fn max_timeout(&self) -> Duration {
                Duration::from_millis(100)
            }
            async fn execute(&self, _: Value, _: &ToolCtx) -> anyhow::Result<ToolResult> {
                futures_never().await
            }
        }
        let mut reg = ToolRegistry::new();
        reg.register(TinyCeiling);
        // Caller asks for an hour; the tool's ceiling wins.
        let err = reg
            .execute("tiny", json!({}), &ctx(), Some(Duration::from_secs(3600)))
            .await;
        assert!(matches!(
            err,
            Err(ToolError::Timeout { after, .. }) if after == Duration::from_millis(100)
        ));
    }

    #[tokio::test]
    async fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(EchoTool);
        assert_eq!(reg.names().len(), 1);
    }
}
