// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::subprocess::ShellStatus;
use crate::tool::{Tool, ToolCtx, ToolResult};

/// Retrieve the output of a background shell started with `run_in_background`.
///
/// Only `bg_N` shell ids route here; worker results are harvested through
/// the worker manager, not through this tool.
pub struct TaskOutputTool;

#[async_trait]
impl Tool for TaskOutputTool {
    fn name(&self) -> &str {
        "TaskOutput"
    }

    fn description(&self) -> &str {
        "Retrieve the accumulated output of a background shell task by its bg_N id. \
         A finished task is removed from the table once its output has been retrieved."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "string",
                    "description": "The bg_N id returned when the command was started"
                }
            },
            "required": ["task_id"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolCtx) -> anyhow::Result<ToolResult> {
        let Some(task_id) = input.get("task_id").and_then(|v| v.as_str()) else {
            return Ok(ToolResult::error("Missing required 'task_id' parameter."));
        };
        if !task_id.starts_with("bg_") {
            return Ok(ToolResult::error(format!(
                "'{task_id}' is not a background shell id. TaskOutput only retrieves \
                 bg_N shell tasks; worker results are returned by the worker that ran them."
            )));
        }
        match ctx.runtime.output(task_id) {
            Some(snapshot) => {
                let status = match snapshot.status {
                    ShellStatus::Running => "[running]".to_string(),
                    ShellStatus::Exited(Some(code)) => format!("[exited with code {code}]"),
                    ShellStatus::Exited(None) => "[exited]".to_string(),
                    ShellStatus::Killed => "[killed]".to_string(),
                };
                let content = if snapshot.output.is_empty() {
                    status
                } else {
                    format!("{status}\n{}", snapshot.output)
                };
                Ok(ToolResult::ok(content))
            }
            None => Ok(ToolResult::error(format!(
                "No background task with id '{task_id}'. It may have finished and \
                 already been retrieved."
            ))),
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
