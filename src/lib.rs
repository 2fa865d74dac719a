// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Capstan — an agentic execution core.
//!
//! Capstan drives a multi-turn conversation with an LLM over a streaming
//! transport, interleaves locally-executed tool calls with model output, and
//! persists an append-only transcript from which sessions resume.  The
//! pieces live in four member crates and are re-exported here:
//!
//! - [`capstan_model`] — message data model, SSE parsing, turn reassembly,
//!   and the Anthropic streaming transport.
//! - [`capstan_tools`] — the tool contract, registry, hook interceptors, and
//!   the subprocess shell runtime.
//! - [`capstan_mcp`] — MCP servers as child processes: JSON-RPC client,
//!   lifecycle manager, tool projection.
//! - [`capstan_core`] — the agent loop, sessions, transcripts, and workers.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use capstan::{AgentBuilder, AgentEvent, AnthropicClient, Message, StaticCredential};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let client = Arc::new(AnthropicClient::new(Arc::new(StaticCredential::new(
//!     std::env::var("ANTHROPIC_API_KEY")?,
//! ))));
//! let mut agent = AgentBuilder::new(client).build()?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(256);
//! let run = agent.run(vec![Message::user("list the files here")], tx);
//! let print = async {
//!     while let Some(event) = rx.recv().await {
//!         if let AgentEvent::Text { text } = event {
//!             print!("{text}");
//!         }
//!     }
//! };
//! let (result, _) = tokio::join!(run, print);
//! result?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

pub use capstan_core::{
    load_transcript, project_dir_name, transcript_dir, Agent, AgentConfig, AgentEvent,
    AssistantMeta, AutoCompactConfig, Compactor, Session, TranscriptError, TranscriptLoad,
    TranscriptWriter, TruncationInfo, WorkerArchetype, WorkerManager, WorkerOutcome, WorkerSpec,
    WorkerState,
};
pub use capstan_mcp::{
    projected_tools, McpClient, McpError, McpServerConfig, McpServerManager, ServerState,
};
pub use capstan_model::{
    text_turn, tool_use_turn, AnthropicClient, AssembledTurn, AssemblyEvent, ContentBlock,
    CredentialSource, Message, MessageRequest, ModelClient, Role, Script, ScriptedClient,
    SseParser, StaticCredential, StopReason, StreamEvent, ThinkingConfig, ToolDefinition,
    ToolResultContent, TransportError, TurnAssembler, Usage,
};
pub use capstan_tools::{
    BashTool, Hook, HookDecision, HookEvent, HookInput, HookRegistry, KillShellTool,
    SubprocessRuntime, TaskOutputTool, Tool, ToolCtx, ToolRegistry, ToolResult, WebSearchTool,
};

/// The default tool set: the subprocess-backed shell family plus the
/// web-search stub.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(BashTool);
    registry.register(TaskOutputTool);
    registry.register(KillShellTool);
    registry.register(WebSearchTool);
    registry
}

/// Assembles an [`Agent`] from its parts: model client, tools, hooks, the
/// subprocess runtime, optional MCP projection, and transcript placement.
pub struct AgentBuilder {
    client: Arc<dyn ModelClient>,
    working_dir: PathBuf,
    config: AgentConfig,
    tools: ToolRegistry,
    hooks: Arc<HookRegistry>,
    runtime: Arc<SubprocessRuntime>,
    compactor: Option<Arc<dyn Compactor>>,
    mcp: Option<Arc<McpServerManager>>,
    transcript: bool,
    transcript_writer: Option<TranscriptWriter>,
}

impl AgentBuilder {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self {
            client,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            config: AgentConfig::default(),
            tools: builtin_registry(),
            hooks: Arc::new(HookRegistry::new()),
            runtime: Arc::new(SubprocessRuntime::new()),
            compactor: None,
            mcp: None,
            transcript: false,
            transcript_writer: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the tool set entirely.
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn register_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.register(tool);
        self
    }

    /// Share a hook registry (e.g. with sibling loops and workers).
    pub fn hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Share a subprocess runtime so loops see the same background table.
    pub fn runtime(mut self, runtime: Arc<SubprocessRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn compactor(mut self, compactor: Arc<dyn Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    /// Project the manager's connected MCP tools into the registry at build
    /// time, under `mcp__<server>__<tool>` names.
    pub fn mcp(mut self, manager: Arc<McpServerManager>) -> Self {
        self.mcp = Some(manager);
        self
    }

    /// Write the transcript at its canonical home-directory location.
    pub fn transcript(mut self, enabled: bool) -> Self {
        self.transcript = enabled;
        self
    }

    /// Write the transcript at an explicit path instead.
    pub fn transcript_writer(mut self, writer: TranscriptWriter) -> Self {
        self.transcript_writer = Some(writer);
        self
    }

    pub fn build(self) -> anyhow::Result<Agent> {
        let mut tools = self.tools;
        if let Some(manager) = &self.mcp {
            for tool in projected_tools(manager) {
                tools.register_arc(tool);
            }
        }

        let mut agent = Agent::new(
            self.client,
            Arc::new(tools),
            self.hooks,
            self.runtime,
            self.config,
            self.working_dir,
        );
        if let Some(writer) = self.transcript_writer {
            agent = agent.with_transcript_writer(writer);
        } else if self.transcript {
            agent = agent.with_transcript()?;
        }
        if let Some(compactor) = self.compactor {
            agent = agent.with_compactor(compactor);
        }
        Ok(agent)
    }

    /// Build an agent resumed from a prior session's transcript.  The
    /// history is validated on load; an interrupted tool cycle is truncated
    /// so the next request is well-formed.  New turns append to the same
    /// file.
    pub fn resume(self, session_id: &str) -> anyhow::Result<(Agent, Option<TruncationInfo>)> {
        let working_dir = self.working_dir.clone();
        let want_transcript = self.transcript;
        let mut builder = self;
        builder.transcript = false;

        let path = transcript_dir(&working_dir)
            .context("resolving transcript directory")?
            .join(format!("{session_id}.jsonl"));
        let loaded = load_transcript(&path)
            .with_context(|| format!("loading transcript {}", path.display()))?;

        let mut agent = builder
            .build()?
            .with_resumed_session(session_id, loaded.messages);
        if want_transcript {
            agent = agent
                .with_transcript_writer(TranscriptWriter::at(path, &working_dir, session_id));
        }
        Ok((agent, loaded.truncation))
    }
}
