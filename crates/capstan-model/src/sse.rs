// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Server-Sent Events framing and typed stream events.
//!
//! [`SseParser`] turns an arbitrary-boundary byte stream into complete SSE
//! events; [`parse_stream_event`] maps a raw `(event, data)` pair into the
//! typed [`StreamEvent`] enum the reassembler consumes.  Events with no
//! type, no data, or unparseable JSON are dropped silently — the wire
//! contract is best-effort and a single garbled frame must not poison the
//! turn.

use serde_json::Value;

use crate::types::{ContentBlock, StopReason, Usage};

// ─── Typed stream events ──────────────────────────────────────────────────────

/// A typed event from the messages stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Start of the response message; carries the initial usage snapshot.
    MessageStart { usage: Usage },
    /// A new content block opened at `index`.  Server-side blocks
    /// (`server_tool_use`, `web_search_tool_result`) arrive complete here.
    ContentBlockStart { index: usize, block: ContentBlock },
    ContentBlockDelta { index: usize, delta: BlockDelta },
    ContentBlockStop { index: usize },
    /// End-of-turn metadata: the stop reason and the updated output-token
    /// count.
    MessageDelta {
        stop_reason: Option<StopReason>,
        output_tokens: u64,
    },
    MessageStop,
    Ping,
    Error { message: String },
}

/// Delta payload applied to the block at its index.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockDelta {
    Text(String),
    /// Partial JSON for a `tool_use` block's input; only parseable once the
    /// block stops.
    InputJson(String),
    Thinking(String),
    Signature(String),
}

// ─── SSE framing ──────────────────────────────────────────────────────────────

/// Incremental SSE parser.
///
/// Feed it raw bytes as they arrive; it returns every complete event and
/// keeps the trailing fragment buffered for the next read.  Chunk
/// boundaries are arbitrary — a UTF-8 sequence split across reads is held
/// back until its remaining bytes arrive.  Call [`SseParser::finish`] at
/// end-of-stream to parse any residual fragment.
#[derive(Debug, Default)]
pub struct SseParser {
    /// Decoded text not yet split into complete events.
    buf: String,
    /// Undecoded tail: an incomplete UTF-8 sequence from the last chunk.
    pending: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the events completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.decode(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let frame: String = self.buf.drain(..pos + 2).collect();
            if let Some(ev) = parse_frame(&frame) {
                events.push(ev);
            }
        }
        events
    }

    /// Parse whatever is left in the buffer as one final event.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            push_normalized(&mut self.buf, &String::from_utf8_lossy(&tail));
        }
        let rest = std::mem::take(&mut self.buf);
        if rest.trim().is_empty() {
            return None;
        }
        parse_frame(&rest)
    }

    /// Decode as much of the byte stream as is valid UTF-8, carrying an
    /// incomplete trailing sequence forward and replacing truly invalid
    /// bytes.
    fn decode(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    push_normalized(&mut self.buf, text);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    let text = std::str::from_utf8(&self.pending[..valid])
                        .expect("prefix reported valid");
                    push_normalized(&mut self.buf, text);
                    match e.error_len() {
                        Some(bad) => {
                            self.buf.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more.
                            self.pending.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Append text with CRLF framing normalized away; JSON payloads never
/// contain a raw carriage return.
fn push_normalized(buf: &mut String, text: &str) {
    buf.extend(text.chars().filter(|&c| c != '\r'));
}

/// Parse one complete SSE frame (a run of lines).  The last `event:` and
/// `data:` values win when repeated.
fn parse_frame(frame: &str) -> Option<StreamEvent> {
    let mut event_type: Option<&str> = None;
    let mut data: Option<&str> = None;
    for line in frame.lines() {
        if let Some(v) = line.strip_prefix("event:") {
            event_type = Some(v.trim());
        } else if let Some(v) = line.strip_prefix("data:") {
            data = Some(v.trim());
        }
    }
    let (event_type, data) = (event_type?, data?);
    if event_type.is_empty() || data.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(data).ok()?;
    parse_stream_event(event_type, &value)
}

/// Map a raw `(event, data)` pair into a [`StreamEvent`].  Unknown event
/// and delta types are dropped.
pub fn parse_stream_event(event_type: &str, v: &Value) -> Option<StreamEvent> {
    match event_type {
        "message_start" => {
            let usage = v["message"]
                .get("usage")
                .and_then(|u| serde_json::from_value(u.clone()).ok())
                .unwrap_or_default();
            Some(StreamEvent::MessageStart { usage })
        }
        "content_block_start" => {
            let index = v["index"].as_u64()? as usize;
            let block: ContentBlock = serde_json::from_value(v["content_block"].clone()).ok()?;
            Some(StreamEvent::ContentBlockStart { index, block })
        }
        "content_block_delta" => {
            let index = v["index"].as_u64()? as usize;
            let delta = &v["delta"];
            let delta = match delta["type"].as_str()? {
                "text_delta" => BlockDelta::Text(delta["text"].as_str()?.to_string()),
                "input_json_delta" => {
                    BlockDelta::InputJson(delta["partial_json"].as_str()?.to_string())
                }
                "thinking_delta" => BlockDelta::Thinking(delta["thinking"].as_str()?.to_string()),
                "signature_delta" => {
                    BlockDelta::Signature(delta["signature"].as_str()?.to_string())
                }
                _ => return None,
            };
            Some(StreamEvent::ContentBlockDelta { index, delta })
        }
        "content_block_stop" => {
            let index = v["index"].as_u64()? as usize;
            Some(StreamEvent::ContentBlockStop { index })
        }
        "message_delta" => {
            let stop_reason = v["delta"]["stop_reason"]
                .as_str()
                .map(StopReason::from_wire);
            let output_tokens = v["usage"]["output_tokens"].as_u64().unwrap_or(0);
            Some(StreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            })
        }
        "message_stop" => Some(StreamEvent::MessageStop),
        "ping" => Some(StreamEvent::Ping),
        "error" => {
            let message = v["error"]["message"]
                .as_str()
                .unwrap_or("unknown stream error")
                .to_string();
            Some(StreamEvent::Error { message })
        }
        _ => None,
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
