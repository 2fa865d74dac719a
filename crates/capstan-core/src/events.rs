// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use capstan_model::{StopReason, Usage};

/// Events emitted by the agent loop, in causal order within a session.
/// Consumers drive their UI from this stream; `Done` is always the final
/// event.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A streamed text fragment.
    Text { text: String },
    /// A complete thinking block (never emitted mid-flight).
    Thinking { text: String },
    /// The model requested a local tool invocation.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// A server-executed tool invocation — informational only.
    ServerToolUse {
        id: String,
        name: String,
        input: Value,
    },
    WebSearchResult {
        tool_use_id: String,
        content: Value,
    },
    /// A tool finished (or was blocked); mirrors the tool_result sent back
    /// to the model.
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// One model turn finished streaming; carries that turn's usage.
    TurnComplete { usage: Usage },
    /// History was replaced by the compactor.
    Compact {
        previous_message_count: usize,
        new_message_count: usize,
    },
    Error { message: String },
    /// Terminal event of a `run` call.
    Done {
        stop_reason: StopReason,
        total_usage: Usage,
        turn_count: u32,
        session_id: String,
    },
}
