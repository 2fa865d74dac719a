// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! JSON-RPC 2.0 frames and MCP payload types.
//!
//! Every message is a single newline-delimited line of JSON over the
//! child's stdio.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── Frames ───────────────────────────────────────────────────────────────────

/// A request (has an `id`, expects a response).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A notification (no `id`, fire-and-forget).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

// ─── MCP payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: ClientInfo,
}

/// Build the `initialize` request parameters.
pub fn initialize_params() -> InitializeParams {
    InitializeParams {
        protocol_version: PROTOCOL_VERSION.into(),
        capabilities: serde_json::json!({}),
        client_info: ClientInfo {
            name: "capstan".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        },
    }
}

/// One tool definition from `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<McpToolDef>,
}

/// One content item in a `tools/call` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolCallContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Text rendering of the content array; non-text items are skipped.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|c| c.content_type == "text")
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_version_and_id() {
        let req = JsonRpcRequest::new(1, "initialize", Some(serde_json::json!({"x": 1})));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
    }

    #[test]
    fn request_without_params_omits_field() {
        let req = JsonRpcRequest::new(2, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn notification_has_no_id() {
        let n = JsonRpcNotification::new("notifications/initialized");
        let json = serde_json::to_string(&n).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn error_response_deserializes() {
        let raw = r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32601,"message":"Method not found"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.id, 7);
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(format!("{err}"), "JSON-RPC error -32601: Method not found");
    }

    #[test]
    fn tools_list_parses_camel_case_schema() {
        let raw = r#"{"tools":[{"name":"read_file","description":"Read","inputSchema":{"type":"object","properties":{"path":{"type":"string"}}}}]}"#;
        let result: ToolsListResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.tools[0].name, "read_file");
        assert!(result.tools[0].input_schema["properties"]["path"].is_object());
    }

    #[test]
    fn tools_list_missing_fields_use_defaults() {
        let raw = r#"{"tools":[{"name":"ping"}]}"#;
        let result: ToolsListResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.tools[0].description, "");
        assert_eq!(result.tools[0].input_schema["type"], "object");
    }

    #[test]
    fn tool_call_result_text_rendering() {
        let raw = r#"{"content":[{"type":"text","text":"a"},{"type":"image","text":""},{"type":"text","text":"b"}],"isError":false}"#;
        let result: ToolCallResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.text(), "a\nb");
        assert!(!result.is_error);
    }

    #[test]
    fn initialize_params_pin_protocol_version() {
        let p = initialize_params();
        assert_eq!(p.protocol_version, "2024-11-05");
        assert_eq!(p.client_info.name, "capstan");
        let json = serde_json::to_value(&p).unwrap();
        assert!(json.get("protocolVersion").is_some());
        assert!(json.get("clientInfo").is_some());
    }
}
