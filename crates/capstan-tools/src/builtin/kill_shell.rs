// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCtx, ToolResult};

/// Terminate a background shell started with `run_in_background`.
pub struct KillShellTool;

#[async_trait]
impl Tool for KillShellTool {
    fn name(&self) -> &str {
        "KillShell"
    }

    fn description(&self) -> &str {
        "Kill a running background shell task by its bg_N id."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "shell_id": {
                    "type": "string",
                    "description": "The bg_N id of the shell to kill"
                }
            },
            "required": ["shell_id"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolCtx) -> anyhow::Result<ToolResult> {
        let Some(shell_id) = input.get("shell_id").and_then(|v| v.as_str()) else {
            return Ok(ToolResult::error("Missing required 'shell_id' parameter."));
        };
        if ctx.runtime.kill(shell_id) {
            Ok(ToolResult::ok(format!("Killed {shell_id}")))
        } else {
            Ok(ToolResult::error(format!(
                "No running background task with id '{shell_id}'."
            )))
        }
    }
}
