// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Projection of MCP tools into the tool registry.
//!
//! Each discovered MCP tool appears under the namespaced name
//! `mcp__<server>__<tool>`.  Calls route through the manager; any failure —
//! connection loss, timeout, server-reported error — degrades to an
//! `is_error` tool result so the agent loop keeps going.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use capstan_tools::{Tool, ToolCtx, ToolResult};

use crate::manager::McpServerManager;
use crate::protocol::McpToolDef;

pub fn projected_name(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

pub struct McpToolProxy {
    manager: Arc<McpServerManager>,
    server: String,
    tool: String,
    full_name: String,
    description: String,
    schema: Value,
}

impl McpToolProxy {
    pub fn new(manager: Arc<McpServerManager>, server: impl Into<String>, def: McpToolDef) -> Self {
        let server = server.into();
        let full_name = projected_name(&server, &def.name);
        Self {
            manager,
            server,
            tool: def.name,
            full_name,
            description: def.description,
            schema: def.input_schema,
        }
    }
}

#[async_trait]
impl Tool for McpToolProxy {
    fn name(&self) -> &str {
        &self.full_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, input: Value, _ctx: &ToolCtx) -> anyhow::Result<ToolResult> {
        match self.manager.call_tool(&self.server, &self.tool, input).await {
            Ok(result) => {
                let text = result.text();
                if result.is_error {
                    Ok(ToolResult::error(text))
                } else {
                    Ok(ToolResult::ok(text))
                }
            }
            Err(e) => Ok(ToolResult::error(format!(
                "MCP tool '{}' on server '{}' failed: {e}",
                self.tool, self.server
            ))),
        }
    }
}

/// One proxy per tool of every connected server, ready for registration.
pub fn projected_tools(manager: &Arc<McpServerManager>) -> Vec<Arc<dyn Tool>> {
    manager
        .connected_tools()
        .into_iter()
        .map(|(server, def)| {
            Arc::new(McpToolProxy::new(Arc::clone(manager), server, def)) as Arc<dyn Tool>
        })
        .collect()
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
