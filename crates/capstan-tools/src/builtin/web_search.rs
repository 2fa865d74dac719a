// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCtx, ToolResult};

/// Local web-search stub.
///
/// Real web search runs server-side and flows back through the opaque
/// `server_tool_use` / `web_search_tool_result` path.  When the model calls
/// the local name anyway, it gets an error result explaining that.
pub struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "WebSearch"
    }

    fn description(&self) -> &str {
        "Search the web. Only available when the server-side web_search tool is enabled."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, _input: Value, _ctx: &ToolCtx) -> anyhow::Result<ToolResult> {
        Ok(ToolResult::error(
            "Web search is not available locally. Enable the provider's server-side \
             web_search tool; its results arrive as web_search_tool_result blocks.",
        ))
    }
}
