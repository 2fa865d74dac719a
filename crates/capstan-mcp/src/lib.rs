// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP (Model Context Protocol) client side for the agentic core.
//!
//! Line-delimited JSON-RPC 2.0 over child-process stdio: a correlation-table
//! [`McpClient`], a lifecycle [`McpServerManager`] with health checks and
//! exponential-backoff crash restarts, and the projection of discovered MCP
//! tools into the tool registry under `mcp__<server>__<tool>` names.

pub mod client;
pub mod manager;
pub mod projection;
pub mod protocol;

pub use client::{McpClient, McpError, DEFAULT_REQUEST_TIMEOUT};
pub use manager::{
    restart_delay, McpServerConfig, McpServerManager, ServerState, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_MAX_RESTARTS,
};
pub use projection::{projected_name, projected_tools, McpToolProxy};
pub use protocol::{McpToolDef, ToolCallContent, ToolCallResult, PROTOCOL_VERSION};
