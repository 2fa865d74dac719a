// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Reassembly of a streamed turn.
//!
//! [`TurnAssembler`] folds the typed stream events of one turn into a sparse,
//! index-keyed block map and emits [`AssemblyEvent`]s suitable for a live UI
//! loop.  It is a pure state machine: `apply` takes the next event and
//! returns at most one assembly event; `finish` materializes the assistant
//! message in index order.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::sse::{BlockDelta, StreamEvent};
use crate::types::{ContentBlock, Message, Role, StopReason, Usage};

/// Live event produced while a turn streams in.
///
/// Text is surfaced fragment-by-fragment; thinking and tool_use only once
/// their block completes — partial JSON is never exposed, and reasoning is
/// not leaked mid-flight.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyEvent {
    TextFragment(String),
    Thinking(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ServerToolUse {
        id: String,
        name: String,
        input: Value,
    },
    WebSearchResult {
        tool_use_id: String,
        content: Value,
    },
}

/// Accumulator for one content block.
#[derive(Debug)]
enum BlockState {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
    /// Blocks that arrive complete in `content_block_start` and blocks that
    /// have been sealed by `content_block_stop`.
    Complete(ContentBlock),
}

/// The fully reassembled turn.
#[derive(Debug, Clone)]
pub struct AssembledTurn {
    pub message: Message,
    pub stop_reason: Option<StopReason>,
    pub usage: Usage,
}

#[derive(Debug, Default)]
pub struct TurnAssembler {
    blocks: BTreeMap<usize, BlockState>,
    usage: Usage,
    stop_reason: Option<StopReason>,
}

impl TurnAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the next stream event, returning at most one live event.
    pub fn apply(&mut self, event: StreamEvent) -> Option<AssemblyEvent> {
        match event {
            StreamEvent::MessageStart { usage } => {
                self.usage.add(&usage);
                None
            }
            StreamEvent::ContentBlockStart { index, block } => self.start_block(index, block),
            StreamEvent::ContentBlockDelta { index, delta } => self.apply_delta(index, delta),
            StreamEvent::ContentBlockStop { index } => self.stop_block(index),
            StreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if output_tokens > 0 {
                    self.usage.output_tokens = output_tokens;
                }
                None
            }
            StreamEvent::MessageStop | StreamEvent::Ping | StreamEvent::Error { .. } => None,
        }
    }

    fn start_block(&mut self, index: usize, block: ContentBlock) -> Option<AssemblyEvent> {
        let (state, event) = match block {
            ContentBlock::Text { text } => (BlockState::Text { text }, None),
            ContentBlock::Thinking {
                thinking,
                signature,
            } => (
                BlockState::Thinking {
                    thinking,
                    signature: signature.unwrap_or_default(),
                },
                None,
            ),
            ContentBlock::ToolUse { id, name, .. } => (
                // The start event carries an empty input object; the real
                // arguments stream in through input_json deltas.
                BlockState::ToolUse {
                    id,
                    name,
                    input_json: String::new(),
                },
                None,
            ),
            block @ ContentBlock::ServerToolUse { .. } => {
                let event = match &block {
                    ContentBlock::ServerToolUse { id, name, input } => {
                        Some(AssemblyEvent::ServerToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        })
                    }
                    _ => unreachable!(),
                };
                (BlockState::Complete(block), event)
            }
            block @ ContentBlock::WebSearchToolResult { .. } => {
                let event = match &block {
                    ContentBlock::WebSearchToolResult {
                        tool_use_id,
                        content,
                    } => Some(AssemblyEvent::WebSearchResult {
                        tool_use_id: tool_use_id.clone(),
                        content: content.clone(),
                    }),
                    _ => unreachable!(),
                };
                (BlockState::Complete(block), event)
            }
            block => (BlockState::Complete(block), None),
        };
        self.blocks.insert(index, state);
        event
    }

    fn apply_delta(&mut self, index: usize, delta: BlockDelta) -> Option<AssemblyEvent> {
        let Some(state) = self.blocks.get_mut(&index) else {
            warn!(index, "delta for unopened content block; dropping");
            return None;
        };
        match (state, delta) {
            (BlockState::Text { text }, BlockDelta::Text(fragment)) => {
                text.push_str(&fragment);
                if fragment.is_empty() {
                    None
                } else {
                    Some(AssemblyEvent::TextFragment(fragment))
                }
            }
            (BlockState::ToolUse { input_json, .. }, BlockDelta::InputJson(partial)) => {
                input_json.push_str(&partial);
                None
            }
            (BlockState::Thinking { thinking, .. }, BlockDelta::Thinking(fragment)) => {
                thinking.push_str(&fragment);
                None
            }
            (BlockState::Thinking { signature, .. }, BlockDelta::Signature(fragment)) => {
                signature.push_str(&fragment);
                None
            }
            (_, delta) => {
                warn!(index, ?delta, "delta kind does not match open block; dropping");
                None
            }
        }
    }

    fn stop_block(&mut self, index: usize) -> Option<AssemblyEvent> {
        let state = self.blocks.remove(&index)?;
        let (block, event) = seal_block(state);
        self.blocks.insert(index, BlockState::Complete(block));
        event
    }

    /// Materialize the final assistant message in index order.
    pub fn finish(self) -> AssembledTurn {
        let content = self
            .blocks
            .into_values()
            .map(|state| seal_block(state).0)
            .collect();
        AssembledTurn {
            message: Message {
                role: Role::Assistant,
                content,
            },
            stop_reason: self.stop_reason,
            usage: self.usage,
        }
    }
}

/// Convert an accumulator into its final content block, emitting the
/// block-complete event where one is defined.
fn seal_block(state: BlockState) -> (ContentBlock, Option<AssemblyEvent>) {
    match state {
        BlockState::Text { text } => (ContentBlock::Text { text }, None),
        BlockState::Thinking {
            thinking,
            signature,
        } => {
            let event = AssemblyEvent::Thinking(thinking.clone());
            let signature = if signature.is_empty() {
                None
            } else {
                Some(signature)
            };
            (
                ContentBlock::Thinking {
                    thinking,
                    signature,
                },
                Some(event),
            )
        }
        BlockState::ToolUse {
            id,
            name,
            input_json,
        } => {
            let input = parse_tool_input(&id, &name, &input_json);
            let event = AssemblyEvent::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            };
            (ContentBlock::ToolUse { id, name, input }, Some(event))
        }
        BlockState::Complete(block) => (block, None),
    }
}

/// Parse accumulated tool input JSON.  Empty input means an argument-free
/// call; malformed input is substituted with `{}` so the turn can still be
/// completed — the model sees its own bad arguments via the tool result.
fn parse_tool_input(id: &str, name: &str, input_json: &str) -> Value {
    if input_json.is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(input_json) {
        Ok(v) => v,
        Err(e) => {
            warn!(
                tool_use_id = %id,
                tool_name = %name,
                error = %e,
                "tool_use input was not valid JSON; substituting {{}}"
            );
            Value::Object(Default::default())
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::{BlockDelta, StreamEvent};

    fn text_delta(index: usize, s: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::Text(s.into()),
        }
    }

    fn start_text(index: usize) -> StreamEvent {
        StreamEvent::ContentBlockStart {
            index,
            block: ContentBlock::Text {
                text: String::new(),
            },
        }
    }

    // ── Text blocks ───────────────────────────────────────────────────────────

    #[test]
    fn text_deltas_emit_fragments_and_concatenate() {
        let mut a = TurnAssembler::new();
        assert_eq!(a.apply(start_text(0)), None);
        assert_eq!(
            a.apply(text_delta(0, "hel")),
            Some(AssemblyEvent::TextFragment("hel".into()))
        );
        assert_eq!(
            a.apply(text_delta(0, "lo")),
            Some(AssemblyEvent::TextFragment("lo".into()))
        );
        assert_eq!(a.apply(StreamEvent::ContentBlockStop { index: 0 }), None);

        let turn = a.finish();
        assert_eq!(turn.message.text(), "hello");
    }

    #[test]
    fn fragments_concatenated_in_emission_order_equal_final_text() {
        let parts = ["a", "bb", "", "ccc", "d"];
        let mut a = TurnAssembler::new();
        a.apply(start_text(0));
        let mut emitted = String::new();
        for p in parts {
            if let Some(AssemblyEvent::TextFragment(f)) = a.apply(text_delta(0, p)) {
                emitted.push_str(&f);
            }
        }
        let turn = a.finish();
        assert_eq!(emitted, turn.message.text());
    }

    // ── Thinking blocks ───────────────────────────────────────────────────────

    #[test]
    fn thinking_is_emitted_once_at_block_stop() {
        let mut a = TurnAssembler::new();
        a.apply(StreamEvent::ContentBlockStart {
            index: 0,
            block: ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
        });
        // No per-delta emission: reasoning must not leak in-flight.
        assert_eq!(
            a.apply(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::Thinking("step one".into()),
            }),
            None
        );
        assert_eq!(
            a.apply(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::Thinking(", step two".into()),
            }),
            None
        );
        let ev = a.apply(StreamEvent::ContentBlockStop { index: 0 });
        assert_eq!(ev, Some(AssemblyEvent::Thinking("step one, step two".into())));
    }

    #[test]
    fn signature_preserved_byte_for_byte_on_finish() {
        let sig_a = "EqQBCgIYAhIk";
        let sig_b = "Ym9keQ==";
        let mut a = TurnAssembler::new();
        a.apply(StreamEvent::ContentBlockStart {
            index: 0,
            block: ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
        });
        a.apply(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::Thinking("t".into()),
        });
        a.apply(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::Signature(sig_a.into()),
        });
        a.apply(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::Signature(sig_b.into()),
        });
        a.apply(StreamEvent::ContentBlockStop { index: 0 });

        let turn = a.finish();
        match &turn.message.content[0] {
            ContentBlock::Thinking { signature, .. } => {
                assert_eq!(signature.as_deref(), Some(format!("{sig_a}{sig_b}").as_str()));
            }
            other => panic!("wrong block: {other:?}"),
        }
    }

    // ── Tool use blocks ───────────────────────────────────────────────────────

    fn start_tool(index: usize, id: &str, name: &str) -> StreamEvent {
        StreamEvent::ContentBlockStart {
            index,
            block: ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input: serde_json::json!({}),
            },
        }
    }

    #[test]
    fn tool_input_json_is_never_emitted_partially() {
        let mut a = TurnAssembler::new();
        a.apply(start_tool(0, "t1", "Read"));
        assert_eq!(
            a.apply(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::InputJson("{\"file_path\":".into()),
            }),
            None
        );
        let ev = a.apply(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::InputJson("\"/tmp/x\"}".into()),
        });
        assert_eq!(ev, None);

        let ev = a.apply(StreamEvent::ContentBlockStop { index: 0 });
        assert_eq!(
            ev,
            Some(AssemblyEvent::ToolUse {
                id: "t1".into(),
                name: "Read".into(),
                input: serde_json::json!({"file_path": "/tmp/x"}),
            })
        );
    }

    #[test]
    fn empty_tool_input_parses_to_empty_object() {
        let mut a = TurnAssembler::new();
        a.apply(start_tool(0, "t1", "Ping"));
        let ev = a.apply(StreamEvent::ContentBlockStop { index: 0 });
        assert_eq!(
            ev,
            Some(AssemblyEvent::ToolUse {
                id: "t1".into(),
                name: "Ping".into(),
                input: serde_json::json!({}),
            })
        );
    }

    #[test]
    fn malformed_tool_input_falls_back_to_empty_object() {
        let mut a = TurnAssembler::new();
        a.apply(start_tool(0, "t1", "Bash"));
        a.apply(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::InputJson("{\"command\": \"ls".into()),
        });
        let ev = a.apply(StreamEvent::ContentBlockStop { index: 0 });
        assert_eq!(
            ev,
            Some(AssemblyEvent::ToolUse {
                id: "t1".into(),
                name: "Bash".into(),
                input: serde_json::json!({}),
            })
        );
    }

    // ── Server-side blocks ────────────────────────────────────────────────────

    #[test]
    fn server_tool_use_emitted_immediately_on_start() {
        let mut a = TurnAssembler::new();
        let ev = a.apply(StreamEvent::ContentBlockStart {
            index: 0,
            block: ContentBlock::ServerToolUse {
                id: "srv1".into(),
                name: "web_search".into(),
                input: serde_json::json!({"query": "rust sse"}),
            },
        });
        assert_eq!(
            ev,
            Some(AssemblyEvent::ServerToolUse {
                id: "srv1".into(),
                name: "web_search".into(),
                input: serde_json::json!({"query": "rust sse"}),
            })
        );
    }

    #[test]
    fn web_search_result_emitted_immediately_and_kept_in_message() {
        let results = serde_json::json!([{"url": "https://example.com"}]);
        let mut a = TurnAssembler::new();
        let ev = a.apply(StreamEvent::ContentBlockStart {
            index: 0,
            block: ContentBlock::WebSearchToolResult {
                tool_use_id: "srv1".into(),
                content: results.clone(),
            },
        });
        assert_eq!(
            ev,
            Some(AssemblyEvent::WebSearchResult {
                tool_use_id: "srv1".into(),
                content: results,
            })
        );
        let turn = a.finish();
        assert_eq!(turn.message.content.len(), 1);
    }

    // ── Message-level state ───────────────────────────────────────────────────

    #[test]
    fn stop_reason_and_output_tokens_captured_from_message_delta() {
        let mut a = TurnAssembler::new();
        a.apply(StreamEvent::MessageStart {
            usage: Usage {
                input_tokens: 40,
                ..Default::default()
            },
        });
        a.apply(StreamEvent::MessageDelta {
            stop_reason: Some(StopReason::ToolUse),
            output_tokens: 17,
        });
        let turn = a.finish();
        assert_eq!(turn.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(turn.usage.input_tokens, 40);
        assert_eq!(turn.usage.output_tokens, 17);
    }

    #[test]
    fn blocks_materialize_in_index_order() {
        let mut a = TurnAssembler::new();
        // Open out of order: index 1 before index 0.
        a.apply(start_tool(1, "t1", "Bash"));
        a.apply(start_text(0));
        a.apply(text_delta(0, "first"));
        a.apply(StreamEvent::ContentBlockStop { index: 1 });
        a.apply(StreamEvent::ContentBlockStop { index: 0 });

        let turn = a.finish();
        assert!(matches!(turn.message.content[0], ContentBlock::Text { .. }));
        assert!(matches!(
            turn.message.content[1],
            ContentBlock::ToolUse { .. }
        ));
    }

    #[test]
    fn unfinished_blocks_still_materialize_at_end_of_stream() {
        // Stream dropped before content_block_stop: finish() must still
        // produce the partial text so abort paths see what arrived.
        let mut a = TurnAssembler::new();
        a.apply(start_text(0));
        a.apply(text_delta(0, "partial"));
        let turn = a.finish();
        assert_eq!(turn.message.text(), "partial");
    }

    #[test]
    fn delta_for_unknown_index_is_dropped() {
        let mut a = TurnAssembler::new();
        assert_eq!(a.apply(text_delta(3, "orphan")), None);
        let turn = a.finish();
        assert!(turn.message.content.is_empty());
    }
}
