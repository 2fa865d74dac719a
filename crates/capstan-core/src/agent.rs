// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use capstan_model::{
    AssemblyEvent, ContentBlock, Message, MessageRequest, ModelClient, StopReason, StreamEvent,
    ThinkingConfig, ToolResultContent, TurnAssembler,
};
use capstan_tools::{
    HookEvent, HookInput, HookRegistry, SubprocessRuntime, ToolCtx, ToolError, ToolRegistry,
};

use crate::compact::{should_compact, AutoCompactConfig, Compactor};
use crate::events::AgentEvent;
use crate::session::Session;
use crate::transcript::{AssistantMeta, TranscriptWriter};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    /// Caller system content, sent after the protocol-required prefix.
    pub system: Vec<String>,
    pub thinking: Option<ThinkingConfig>,
    /// Ceiling on model turns per `run` call; `None` is unbounded.
    pub max_turns: Option<u32>,
    pub auto_compact: AutoCompactConfig,
    /// Per-call tool timeout override; tools still clamp to their own max.
    pub tool_timeout: Option<Duration>,
    /// Environment overlay for spawned processes.
    pub env: HashMap<String, String>,
    /// Opaque server-side tool definitions forwarded with every request.
    pub extra_tools: Vec<Value>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".into(),
            max_tokens: 8192,
            system: Vec::new(),
            thinking: None,
            max_turns: None,
            auto_compact: AutoCompactConfig::default(),
            tool_timeout: None,
            env: HashMap::new(),
            extra_tools: Vec::new(),
        }
    }
}

enum Dispatch {
    Results(Vec<ContentBlock>),
    Cancelled,
}

/// The agent loop: model turn → tool dispatch → repeat until a terminal
/// stop reason, the turn budget, or cancellation.
pub struct Agent {
    session: Session,
    client: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookRegistry>,
    runtime: Arc<SubprocessRuntime>,
    config: AgentConfig,
    transcript: Option<TranscriptWriter>,
    compactor: Option<Arc<dyn Compactor>>,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(
        client: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        hooks: Arc<HookRegistry>,
        runtime: Arc<SubprocessRuntime>,
        config: AgentConfig,
        working_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            session: Session::new(working_dir),
            client,
            tools,
            hooks,
            runtime,
            config,
            transcript: None,
            compactor: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Write the transcript at its canonical location under the home dir.
    pub fn with_transcript(mut self) -> anyhow::Result<Self> {
        self.transcript = Some(TranscriptWriter::for_session(
            &self.session.working_dir,
            &self.session.id,
        )?);
        Ok(self)
    }

    /// Write the transcript at an explicit path.
    pub fn with_transcript_writer(mut self, writer: TranscriptWriter) -> Self {
        self.transcript = Some(writer);
        self
    }

    pub fn with_compactor(mut self, compactor: Arc<dyn Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    /// Adopt an external cancellation token (e.g. a worker's).
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resume: adopt a session id and a previously-loaded history.
    pub fn with_resumed_session(mut self, id: impl Into<String>, messages: Vec<Message>) -> Self {
        let working_dir = self.session.working_dir.clone();
        self.session = Session::with_id(working_dir, id);
        self.session.messages = messages;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Token observed by the transport, every tool call, and all child
    /// spawns.  Cancelling it ends the loop with a `cancelled` done event.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the conversation until a terminal stop reason.
    ///
    /// `new_messages` joins the history on the first turn; afterwards the
    /// loop feeds itself with tool-result batches.  Events stream through
    /// `tx`; the final event is always `Done`.
    pub async fn run(
        &mut self,
        new_messages: Vec<Message>,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        let mut pending = new_messages;
        let mut turn_count: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return self.finish(&tx, StopReason::Cancelled, turn_count).await;
            }
            if let Some(max) = self.config.max_turns {
                if turn_count >= max {
                    return self.finish(&tx, StopReason::MaxTurns, turn_count).await;
                }
            }

            // History and transcript advance at the same logical instant.
            for message in pending.drain(..) {
                if let Some(t) = &self.transcript {
                    t.append_user(&message)?;
                }
                self.session.push(message);
            }

            turn_count += 1;
            let request = self.build_request();
            let mut stream = match self.client.stream_message(&request).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx
                        .send(AgentEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    return self.finish(&tx, StopReason::EndTurn, turn_count).await;
                }
            };

            let mut assembler = TurnAssembler::new();
            let mut stream_error: Option<String> = None;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        // The turn's work is discarded: no assistant append,
                        // no transcript write, no further events but Done.
                        return self.finish(&tx, StopReason::Cancelled, turn_count).await;
                    }
                    item = stream.next() => item,
                };
                let event = match next {
                    None => break,
                    Some(Ok(StreamEvent::Error { message })) => {
                        stream_error = Some(message);
                        break;
                    }
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        stream_error = Some(e.to_string());
                        break;
                    }
                };
                if let Some(assembly_event) = assembler.apply(event) {
                    let _ = tx.send(agent_event(assembly_event)).await;
                }
            }

            if let Some(message) = stream_error {
                let _ = tx.send(AgentEvent::Error { message }).await;
                return self.finish(&tx, StopReason::EndTurn, turn_count).await;
            }

            let turn = assembler.finish();
            let assistant = turn.message;
            debug!(
                turn = turn_count,
                stop_reason = ?turn.stop_reason,
                blocks = assistant.content.len(),
                "turn assembled"
            );

            if let Some(t) = &self.transcript {
                t.append_assistant(
                    &assistant,
                    &AssistantMeta {
                        model: self.config.model.clone(),
                        message_id: format!("msg_{}", Uuid::new_v4().simple()),
                        stop_reason: turn.stop_reason,
                        stop_sequence: None,
                        usage: turn.usage.clone(),
                        request_id: format!("req_{}", Uuid::new_v4().simple()),
                    },
                )?;
            }
            self.session.push(assistant.clone());
            self.session.add_usage(&turn.usage);
            let _ = tx
                .send(AgentEvent::TurnComplete {
                    usage: turn.usage.clone(),
                })
                .await;

            if should_compact(&self.config.auto_compact, &turn.usage) {
                if let Some(compactor) = self.compactor.clone() {
                    let previous = self.session.messages.len();
                    match compactor.compact(&self.session.messages).await {
                        Ok(compacted) => {
                            let new_count = compacted.len();
                            self.session.messages = compacted;
                            let _ = tx
                                .send(AgentEvent::Compact {
                                    previous_message_count: previous,
                                    new_message_count: new_count,
                                })
                                .await;
                        }
                        Err(e) => warn!(error = %e, "compactor failed; keeping history"),
                    }
                }
            }

            match turn.stop_reason.unwrap_or(StopReason::EndTurn) {
                StopReason::ToolUse => match self.dispatch_tools(&assistant, &tx).await? {
                    Dispatch::Cancelled => {
                        return self.finish(&tx, StopReason::Cancelled, turn_count).await;
                    }
                    Dispatch::Results(blocks) => {
                        pending = vec![Message::tool_results(blocks)];
                    }
                },
                // end_turn and max_tokens are terminal; anything unknown is
                // treated as end_turn.
                reason @ (StopReason::EndTurn | StopReason::MaxTokens) => {
                    return self.finish(&tx, reason, turn_count).await;
                }
                _ => {
                    return self.finish(&tx, StopReason::EndTurn, turn_count).await;
                }
            }
        }
    }

    /// Run every tool_use block of the turn, in order, through the hook
    /// chain and the registry; collect one tool_result block per call.
    async fn dispatch_tools(
        &self,
        assistant: &Message,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<Dispatch> {
        let mut blocks = Vec::new();

        for block in &assistant.content {
            let ContentBlock::ToolUse { id, name, input } = block else {
                continue;
            };
            if self.cancel.is_cancelled() {
                return Ok(Dispatch::Cancelled);
            }

            let pre = self
                .hooks
                .run(
                    HookEvent::PreToolUse,
                    HookInput {
                        session_id: self.session.id.clone(),
                        tool_name: Some(name.clone()),
                        tool_input: Some(input.clone()),
                        ..Default::default()
                    },
                )
                .await;

            let (content, is_error) = if !pre.allowed {
                let reason = pre.reason.unwrap_or_else(|| "blocked by hook".into());
                (
                    ToolResultContent::Text(format!("Tool blocked: {reason}")),
                    true,
                )
            } else {
                let effective_input = pre.modified_input.unwrap_or_else(|| input.clone());
                let ctx = self.tool_ctx();
                match self
                    .tools
                    .execute(name, effective_input, &ctx, self.config.tool_timeout)
                    .await
                {
                    Ok(result) => {
                        let mut content = result.content;
                        let post = self
                            .hooks
                            .run(
                                HookEvent::PostToolUse,
                                HookInput {
                                    session_id: self.session.id.clone(),
                                    tool_name: Some(name.clone()),
                                    tool_output: Some(content.to_text()),
                                    tool_is_error: Some(result.is_error),
                                    ..Default::default()
                                },
                            )
                            .await;
                        if !post.appended.is_empty() {
                            content.append_text(&post.appended);
                        }
                        (content, result.is_error)
                    }
                    Err(ToolError::Cancelled { .. }) if self.cancel.is_cancelled() => {
                        return Ok(Dispatch::Cancelled);
                    }
                    Err(e) => (ToolResultContent::Text(e.to_string()), true),
                }
            };

            let _ = tx
                .send(AgentEvent::ToolResult {
                    tool_use_id: id.clone(),
                    content: content.to_text(),
                    is_error,
                })
                .await;
            blocks.push(ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content,
                is_error: if is_error { Some(true) } else { None },
            });
        }

        Ok(Dispatch::Results(blocks))
    }

    fn tool_ctx(&self) -> ToolCtx {
        ToolCtx::new(
            self.session.working_dir.clone(),
            self.session.id.clone(),
            Arc::clone(&self.hooks),
            Arc::clone(&self.runtime),
        )
        .with_env(self.config.env.clone())
        .with_cancel(self.cancel.clone())
    }

    fn build_request(&self) -> MessageRequest {
        MessageRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            messages: self.session.messages.clone(),
            system: self.config.system.clone(),
            tools: self.tools.definitions(),
            extra_tools: self.config.extra_tools.clone(),
            thinking: self.config.thinking.clone(),
        }
    }

    async fn finish(
        &self,
        tx: &mpsc::Sender<AgentEvent>,
        stop_reason: StopReason,
        turn_count: u32,
    ) -> anyhow::Result<()> {
        let _ = tx
            .send(AgentEvent::Done {
                stop_reason,
                total_usage: self.session.usage.clone(),
                turn_count,
                session_id: self.session.id.clone(),
            })
            .await;
        Ok(())
    }
}

fn agent_event(event: AssemblyEvent) -> AgentEvent {
    match event {
        AssemblyEvent::TextFragment(text) => AgentEvent::Text { text },
        AssemblyEvent::Thinking(text) => AgentEvent::Thinking { text },
        AssemblyEvent::ToolUse { id, name, input } => AgentEvent::ToolUse { id, name, input },
        AssemblyEvent::ServerToolUse { id, name, input } => {
            AgentEvent::ServerToolUse { id, name, input }
        }
        AssemblyEvent::WebSearchResult {
            tool_use_id,
            content,
        } => AgentEvent::WebSearchResult {
            tool_use_id,
            content,
        },
    }
}
