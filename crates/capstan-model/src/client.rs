// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming transport to the Anthropic messages endpoint.
//!
//! One authenticated, timeouted POST per turn; the response body is SSE and
//! is surfaced as a lazy stream of typed [`StreamEvent`]s.  The only retry
//! the transport performs itself is a single silent credential refresh after
//! a 401 — every other failure is a typed error for the caller to handle.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use crate::credentials::CredentialSource;
use crate::sse::{SseParser, StreamEvent};
use crate::types::MessageRequest;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Beta features sent on every request, comma-joined into `anthropic-beta`.
pub const BETA_FEATURES: &[&str] = &["oauth-2025-04-20", "prompt-caching-2024-07-31"];

/// Protocol-required system prefix.  Always the first system block; caller
/// system content is appended after it.
pub const SYSTEM_PROMPT_PREFIX: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";

/// Wall-clock ceiling for one streaming request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// ─── Errors and the client trait ──────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("authentication failed")]
    Authentication,
    #[error("rate limited")]
    RateLimited { retry_after: Option<u64> },
    #[error("service overloaded")]
    Overloaded,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

pub type StreamEventStream =
    Pin<Box<dyn Stream<Item = Result<StreamEvent, TransportError>> + Send>>;

/// The seam between the agent loop and the LLM endpoint.  Production uses
/// [`AnthropicClient`]; tests use [`crate::ScriptedClient`].
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream_message(&self, req: &MessageRequest)
        -> Result<StreamEventStream, TransportError>;
}

// ─── Anthropic client ─────────────────────────────────────────────────────────

pub struct AnthropicClient {
    base_url: String,
    credentials: Arc<dyn CredentialSource>,
    timeout: Duration,
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            credentials,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send(&self, body: &Value, token: &str) -> Result<reqwest::Response, TransportError> {
        self.http
            .post(format!("{}/v1/messages", self.base_url))
            .timeout(self.timeout)
            .header("authorization", format!("Bearer {token}"))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", BETA_FEATURES.join(","))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.timeout)
                } else {
                    TransportError::Transport(e.to_string())
                }
            })
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn stream_message(
        &self,
        req: &MessageRequest,
    ) -> Result<StreamEventStream, TransportError> {
        let body = build_request_body(req);
        let token = self
            .credentials
            .access_token()
            .await
            .map_err(|_| TransportError::Authentication)?;

        let mut resp = self.send(&body, &token).await?;

        // One silent credential refresh on 401, retrying the identical body.
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            debug!("got 401; refreshing credentials and retrying once");
            let token = self
                .credentials
                .refresh()
                .await
                .map_err(|_| TransportError::Authentication)?;
            resp = self.send(&body, &token).await?;
        }

        let status = resp.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                401 => TransportError::Authentication,
                429 => TransportError::RateLimited {
                    retry_after: resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok()),
                },
                503 | 529 => TransportError::Overloaded,
                _ => {
                    let text = resp.text().await.unwrap_or_default();
                    TransportError::Transport(format!("status {status}: {text}"))
                }
            });
        }

        Ok(sse_event_stream(resp.bytes_stream()))
    }
}

/// Adapt a byte stream into typed stream events via [`SseParser`], flushing
/// the parser's residual fragment at end-of-stream.
fn sse_event_stream<S, B, E>(bytes: S) -> StreamEventStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display,
{
    struct State<S> {
        inner: S,
        parser: SseParser,
        queue: VecDeque<Result<StreamEvent, TransportError>>,
        eof: bool,
    }

    let state = State {
        inner: bytes,
        parser: SseParser::new(),
        queue: VecDeque::new(),
        eof: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.queue.pop_front() {
                return Some((item, st));
            }
            if st.eof {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    st.queue
                        .extend(st.parser.feed(chunk.as_ref()).into_iter().map(Ok));
                }
                Some(Err(e)) => {
                    st.eof = true;
                    st.queue
                        .push_back(Err(TransportError::Transport(e.to_string())));
                }
                None => {
                    st.eof = true;
                    if let Some(ev) = st.parser.finish() {
                        st.queue.push_back(Ok(ev));
                    }
                }
            }
        }
    }))
}

// ─── Request body ─────────────────────────────────────────────────────────────

/// Build the JSON request body, injecting the protocol-required system
/// prefix and the three cache-control markers: one on the prefix, one on
/// the last caller system block, and one on the last content block of the
/// second-to-last user message (the conversation-history breakpoint).
/// Thinking blocks never receive cache markers.
pub fn build_request_body(req: &MessageRequest) -> Value {
    let cache_ctrl = json!({ "type": "ephemeral" });

    // System: required prefix first, marked; caller blocks after, the last
    // one marked.
    let mut system: Vec<Value> = vec![json!({
        "type": "text",
        "text": SYSTEM_PROMPT_PREFIX,
        "cache_control": cache_ctrl.clone(),
    })];
    for (i, block) in req.system.iter().enumerate() {
        if i + 1 == req.system.len() {
            system.push(
                json!({ "type": "text", "text": block, "cache_control": cache_ctrl.clone() }),
            );
        } else {
            system.push(json!({ "type": "text", "text": block }));
        }
    }

    let mut messages: Vec<Value> = req
        .messages
        .iter()
        .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
        .collect();
    mark_history_breakpoint(&mut messages, &cache_ctrl);

    let mut body = json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "messages": messages,
        "system": system,
        "stream": true,
    });

    if !req.tools.is_empty() || !req.extra_tools.is_empty() {
        let mut tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| serde_json::to_value(t).unwrap_or(Value::Null))
            .collect();
        tools.extend(req.extra_tools.iter().cloned());
        body["tools"] = json!(tools);
    }

    if let Some(thinking) = &req.thinking {
        body["thinking"] = json!({
            "type": "enabled",
            "budget_tokens": thinking.budget_tokens,
        });
    }

    body
}

/// Mark the last content block of the second-to-last user message so the
/// growing conversation prefix stays cached across turns.
fn mark_history_breakpoint(messages: &mut [Value], cache_ctrl: &Value) {
    let user_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m["role"] == "user")
        .map(|(i, _)| i)
        .collect();
    if user_indices.len() < 2 {
        return;
    }
    let target = user_indices[user_indices.len() - 2];
    if let Some(blocks) = messages[target]["content"].as_array_mut() {
        if let Some(last) = blocks.last_mut() {
            if last["type"] != "thinking" {
                last["cache_control"] = cache_ctrl.clone();
            }
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentBlock, Message, Role, ThinkingConfig, ToolDefinition};

    fn req_with_messages(messages: Vec<Message>) -> MessageRequest {
        MessageRequest {
            model: "claude-sonnet-4-5".into(),
            max_tokens: 4096,
            messages,
            system: vec!["Be terse.".into()],
            ..Default::default()
        }
    }

    // ── System blocks ─────────────────────────────────────────────────────────

    #[test]
    fn required_prefix_is_first_system_block_and_cached() {
        let body = build_request_body(&req_with_messages(vec![Message::user("hi")]));
        let system = body["system"].as_array().unwrap();
        assert_eq!(system[0]["text"], SYSTEM_PROMPT_PREFIX);
        assert!(system[0]["cache_control"].is_object());
    }

    #[test]
    fn last_caller_system_block_is_cached() {
        let mut req = req_with_messages(vec![Message::user("hi")]);
        req.system = vec!["first".into(), "second".into()];
        let body = build_request_body(&req);
        let system = body["system"].as_array().unwrap();
        assert_eq!(system.len(), 3);
        assert!(system[1]["cache_control"].is_null());
        assert!(system[2]["cache_control"].is_object());
    }

    // ── History breakpoint ────────────────────────────────────────────────────

    #[test]
    fn breakpoint_on_second_to_last_user_message() {
        let body = build_request_body(&req_with_messages(vec![
            Message::user("one"),
            Message::assistant(vec![ContentBlock::Text { text: "a".into() }]),
            Message::user("two"),
            Message::assistant(vec![ContentBlock::Text { text: "b".into() }]),
            Message::user("three"),
        ]));
        let messages = body["messages"].as_array().unwrap();
        // "two" is the second-to-last user message.
        let marked = &messages[2]["content"].as_array().unwrap()[0];
        assert!(marked["cache_control"].is_object());
        // The final user message is not marked.
        let last = &messages[4]["content"].as_array().unwrap()[0];
        assert!(last["cache_control"].is_null());
    }

    #[test]
    fn single_user_message_gets_no_breakpoint() {
        let body = build_request_body(&req_with_messages(vec![Message::user("only")]));
        let blocks = body["messages"][0]["content"].as_array().unwrap();
        assert!(blocks[0]["cache_control"].is_null());
    }

    #[test]
    fn thinking_blocks_never_receive_cache_markers() {
        // A tool-result cycle where the second-to-last user message would be
        // marked, but an assistant thinking block must never be.
        let thinking_tail = Message {
            role: Role::User,
            content: vec![ContentBlock::Thinking {
                thinking: "echoed".into(),
                signature: Some("sig".into()),
            }],
        };
        let body = build_request_body(&req_with_messages(vec![
            thinking_tail,
            Message::assistant(vec![ContentBlock::Text { text: "a".into() }]),
            Message::user("latest"),
        ]));
        let messages = body["messages"].as_array().unwrap();
        let block = &messages[0]["content"].as_array().unwrap()[0];
        assert!(block["cache_control"].is_null());
    }

    // ── Tools and thinking config ─────────────────────────────────────────────

    #[test]
    fn tools_include_typed_and_opaque_definitions() {
        let mut req = req_with_messages(vec![Message::user("hi")]);
        req.tools = vec![ToolDefinition {
            name: "Bash".into(),
            description: "run a command".into(),
            input_schema: json!({"type": "object"}),
        }];
        req.extra_tools = vec![json!({"type": "web_search_20250305", "name": "web_search"})];
        let body = build_request_body(&req);
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "Bash");
        assert_eq!(tools[1]["type"], "web_search_20250305");
    }

    #[test]
    fn no_tools_field_when_empty() {
        let body = build_request_body(&req_with_messages(vec![Message::user("hi")]));
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn thinking_config_serialized_as_enabled() {
        let mut req = req_with_messages(vec![Message::user("hi")]);
        req.thinking = Some(ThinkingConfig {
            budget_tokens: 2048,
        });
        let body = build_request_body(&req);
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 2048);
    }

    #[test]
    fn body_always_streams() {
        let body = build_request_body(&req_with_messages(vec![Message::user("hi")]));
        assert_eq!(body["stream"], true);
    }

    // ── Stream adaptation ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn sse_event_stream_flushes_residual_at_eof() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"event: ping\ndata: {\"type\":\"ping\"}\n\n".to_vec()),
            // No trailing blank line — only the end-of-stream flush sees it.
            Ok(b"event: message_stop\ndata: {\"type\":\"message_stop\"}".to_vec()),
        ];
        let mut stream = sse_event_stream(futures::stream::iter(chunks));
        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        assert_eq!(events, vec![StreamEvent::Ping, StreamEvent::MessageStop]);
    }
}
