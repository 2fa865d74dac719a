// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCtx, ToolResult};

/// Shell commands get a longer leash than ordinary tools.
pub const BASH_MAX_TIMEOUT: Duration = Duration::from_secs(600);

/// Default when the model does not specify `timeout_ms`.
const BASH_DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Built-in shell tool.  Foreground runs block until exit or timeout;
/// `run_in_background` returns a `bg_N` id immediately, harvestable via the
/// `TaskOutput` tool.
pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "Bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         Output above 30,000 bytes is truncated with an elision marker.\n\
         Exit code 0 is success; any other exit code flags the result as an error.\n\
         Set run_in_background to start a long-running command and poll it later\n\
         with TaskOutput. Prefer non-interactive commands; there is no TTY."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Timeout in milliseconds (max 600000)"
                },
                "run_in_background": {
                    "type": "boolean",
                    "description": "Start the command in the background and return a task id"
                }
            },
            "required": ["command"]
        })
    }

    fn max_timeout(&self) -> Duration {
        BASH_MAX_TIMEOUT
    }

    async fn execute(&self, input: Value, ctx: &ToolCtx) -> anyhow::Result<ToolResult> {
        let Some(command) = input.get("command").and_then(|v| v.as_str()) else {
            return Ok(ToolResult::error(
                "Missing required 'command' parameter for the Bash tool.",
            ));
        };
        let background = input
            .get("run_in_background")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let timeout = input
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(BASH_DEFAULT_TIMEOUT)
            .min(BASH_MAX_TIMEOUT);

        debug!(command, background, "executing Bash tool");

        if background {
            let id = ctx.runtime.spawn_background(
                command,
                &ctx.working_dir,
                &ctx.env,
                &ctx.cancel,
            )?;
            return Ok(ToolResult::ok(format!(
                "Command running in background with id: {id}"
            )));
        }

        let outcome = ctx
            .runtime
            .run_foreground(command, &ctx.working_dir, &ctx.env, timeout, &ctx.cancel)
            .await?;

        if outcome.timed_out {
            let mut content = outcome.output;
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&format!("[timed out after {}s]", timeout.as_secs()));
            return Ok(ToolResult::error(content));
        }

        match outcome.exit_code {
            Some(0) => {
                let content = if outcome.output.is_empty() {
                    "[exit 0]".to_string()
                } else {
                    outcome.output
                };
                Ok(ToolResult::ok(content))
            }
            code => {
                let code = code.map(|c| c.to_string()).unwrap_or_else(|| "killed".into());
                let content = if outcome.output.is_empty() {
                    format!("[exit {code}]")
                } else {
                    format!("[exit {code}]\n{}", outcome.output)
                };
                Ok(ToolResult::error(content))
            }
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
