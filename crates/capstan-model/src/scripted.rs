// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic scripted model client for tests.
//!
//! Each call to `stream_message` pops the next script from the front of the
//! queue, so a test can describe an exact multi-turn conversation — tool
//! calls included — with no network access.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::client::{ModelClient, StreamEventStream, TransportError};
use crate::sse::{BlockDelta, StreamEvent};
use crate::types::{ContentBlock, MessageRequest, StopReason, Usage};

/// One scripted model turn: a fixed event sequence or a transport failure.
#[derive(Debug, Clone)]
pub enum Script {
    Events(Vec<StreamEvent>),
    Fail(TransportError),
}

pub struct ScriptedClient {
    scripts: Mutex<Vec<Script>>,
    /// The last request seen, for assertions on what was actually sent.
    pub last_request: Arc<Mutex<Option<MessageRequest>>>,
}

impl ScriptedClient {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Provider that answers every call with a single text turn.
    pub fn always_text(text: impl Into<String>) -> Self {
        Self::new(vec![Script::Events(text_turn(text, StopReason::EndTurn))])
    }

    /// A tool-use turn followed by a closing text turn — the classic
    /// two-turn cycle.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Script::Events(tool_use_turn(tool_id, tool_name, args_json)),
            Script::Events(text_turn(final_text, StopReason::EndTurn)),
        ])
    }
}

/// Build the event sequence for a plain text turn.
pub fn text_turn(text: impl Into<String>, stop_reason: StopReason) -> Vec<StreamEvent> {
    vec![
        StreamEvent::MessageStart {
            usage: Usage {
                input_tokens: 10,
                ..Default::default()
            },
        },
        StreamEvent::ContentBlockStart {
            index: 0,
            block: ContentBlock::Text {
                text: String::new(),
            },
        },
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::Text(text.into()),
        },
        StreamEvent::ContentBlockStop { index: 0 },
        StreamEvent::MessageDelta {
            stop_reason: Some(stop_reason),
            output_tokens: 5,
        },
        StreamEvent::MessageStop,
    ]
}

/// Build the event sequence for a turn that requests one tool call.
pub fn tool_use_turn(
    tool_id: impl Into<String>,
    tool_name: impl Into<String>,
    args_json: impl Into<String>,
) -> Vec<StreamEvent> {
    vec![
        StreamEvent::MessageStart {
            usage: Usage {
                input_tokens: 20,
                ..Default::default()
            },
        },
        StreamEvent::ContentBlockStart {
            index: 0,
            block: ContentBlock::ToolUse {
                id: tool_id.into(),
                name: tool_name.into(),
                input: serde_json::json!({}),
            },
        },
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::InputJson(args_json.into()),
        },
        StreamEvent::ContentBlockStop { index: 0 },
        StreamEvent::MessageDelta {
            stop_reason: Some(StopReason::ToolUse),
            output_tokens: 8,
        },
        StreamEvent::MessageStop,
    ]
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn stream_message(
        &self,
        req: &MessageRequest,
    ) -> Result<StreamEventStream, TransportError> {
        *self.last_request.lock().unwrap() = Some(req.clone());
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Scripts exhausted: end the conversation rather than hang.
                Script::Events(text_turn("[no more scripts]", StopReason::EndTurn))
            } else {
                scripts.remove(0)
            }
        };
        match script {
            Script::Fail(e) => Err(e),
            Script::Events(events) => {
                let items: Vec<Result<StreamEvent, TransportError>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
