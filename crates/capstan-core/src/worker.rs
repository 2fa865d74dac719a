// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Workers: nested agent loops spawned as named sub-tasks.
//!
//! A worker is just another [`Agent`] with its own session id and transcript
//! identity.  The hook registry and the subprocess runtime are shared by
//! reference with the parent.  Foreground workers block the caller;
//! background workers land in a manager table and are harvested by name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use capstan_model::{Message, ModelClient, StopReason};
use capstan_tools::{HookEvent, HookInput, HookRegistry, SubprocessRuntime, ToolRegistry};

use crate::agent::{Agent, AgentConfig};
use crate::events::AgentEvent;

/// System-prompt archetypes for sub-tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerArchetype {
    /// Balanced default for delegated work.
    #[default]
    General,
    /// Read-heavy reconnaissance; reports findings, avoids edits.
    Explorer,
    /// Critiques existing work and reports problems.
    Reviewer,
}

impl WorkerArchetype {
    pub fn system_prompt(&self) -> &'static str {
        match self {
            Self::General => {
                "You are a focused sub-agent completing one delegated task. \
                 Work autonomously, then reply with a concise final report of \
                 what you did and found."
            }
            Self::Explorer => {
                "You are a read-only exploration sub-agent. Inspect, search, \
                 and summarize; do not modify anything. Reply with your \
                 findings and the paths that matter."
            }
            Self::Reviewer => {
                "You are a review sub-agent. Examine the delegated material \
                 critically and reply with concrete problems found, ordered \
                 by severity, or state that none were found."
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub prompt: String,
    pub archetype: WorkerArchetype,
    /// Model override; `None` inherits the parent's model.
    pub model: Option<String>,
    /// Restrict the worker to a subset of the parent's tools.
    pub tools: Option<Vec<String>>,
    pub max_turns: Option<u32>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            archetype: WorkerArchetype::default(),
            model: None,
            tools: None,
            max_turns: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub state: WorkerState,
    /// Concatenated text output of the worker's turns.
    pub output: String,
}

struct WorkerEntry {
    state: Arc<Mutex<WorkerState>>,
    cancel: CancellationToken,
    handle: JoinHandle<WorkerOutcome>,
}

/// Spawns and tracks nested agent loops.
pub struct WorkerManager {
    client: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookRegistry>,
    runtime: Arc<SubprocessRuntime>,
    working_dir: PathBuf,
    base_config: AgentConfig,
    workers: Mutex<HashMap<String, WorkerEntry>>,
}

impl WorkerManager {
    pub fn new(
        client: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        hooks: Arc<HookRegistry>,
        runtime: Arc<SubprocessRuntime>,
        working_dir: impl Into<PathBuf>,
        base_config: AgentConfig,
    ) -> Self {
        Self {
            client,
            tools,
            hooks,
            runtime,
            working_dir: working_dir.into(),
            base_config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Run a worker in the foreground, blocking until it finishes.
    pub async fn run(&self, spec: WorkerSpec) -> WorkerOutcome {
        let state = Arc::new(Mutex::new(WorkerState::Running));
        self.execute(spec, state, CancellationToken::new()).await
    }

    /// Start a worker in the background; returns its name for later
    /// harvesting.  A worker with the same name replaces the old entry.
    pub fn spawn(&self, spec: WorkerSpec) -> String {
        let name = spec.name.clone();
        let state = Arc::new(Mutex::new(WorkerState::Running));
        let cancel = CancellationToken::new();

        let deps = self.deps();
        let task_state = Arc::clone(&state);
        let task_cancel = cancel.clone();
        let task_spec = spec;
        let handle = tokio::spawn(async move {
            deps.execute(task_spec, task_state, task_cancel).await
        });

        self.workers.lock().expect("worker table poisoned").insert(
            name.clone(),
            WorkerEntry {
                state,
                cancel,
                handle,
            },
        );
        name
    }

    /// Await a background worker's outcome and remove it from the table.
    pub async fn harvest(&self, name: &str) -> Option<WorkerOutcome> {
        let entry = self
            .workers
            .lock()
            .expect("worker table poisoned")
            .remove(name)?;
        match entry.handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                debug!(worker = name, error = %e, "worker task panicked");
                Some(WorkerOutcome {
                    state: WorkerState::Failed,
                    output: format!("worker task panicked: {e}"),
                })
            }
        }
    }

    pub fn state(&self, name: &str) -> Option<WorkerState> {
        self.workers
            .lock()
            .expect("worker table poisoned")
            .get(name)
            .map(|e| *e.state.lock().expect("worker state poisoned"))
    }

    /// Request cancellation of a background worker.
    pub fn cancel(&self, name: &str) -> bool {
        match self
            .workers
            .lock()
            .expect("worker table poisoned")
            .get(name)
        {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workers
            .lock()
            .expect("worker table poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn deps(&self) -> WorkerDeps {
        WorkerDeps {
            client: Arc::clone(&self.client),
            tools: Arc::clone(&self.tools),
            hooks: Arc::clone(&self.hooks),
            runtime: Arc::clone(&self.runtime),
            working_dir: self.working_dir.clone(),
            base_config: self.base_config.clone(),
        }
    }

    async fn execute(
        &self,
        spec: WorkerSpec,
        state: Arc<Mutex<WorkerState>>,
        cancel: CancellationToken,
    ) -> WorkerOutcome {
        self.deps().execute(spec, state, cancel).await
    }
}

/// Everything a worker needs, detached from the manager so background tasks
/// do not borrow it.
struct WorkerDeps {
    client: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookRegistry>,
    runtime: Arc<SubprocessRuntime>,
    working_dir: PathBuf,
    base_config: AgentConfig,
}

impl WorkerDeps {
    async fn execute(
        self,
        spec: WorkerSpec,
        state: Arc<Mutex<WorkerState>>,
        cancel: CancellationToken,
    ) -> WorkerOutcome {
        let _ = self
            .hooks
            .run(
                HookEvent::WorkerStart,
                HookInput {
                    worker_name: Some(spec.name.clone()),
                    ..Default::default()
                },
            )
            .await;

        let tools = match &spec.tools {
            Some(names) => Arc::new(self.tools.subset(names)),
            None => Arc::clone(&self.tools),
        };
        let mut config = self.base_config.clone();
        if let Some(model) = &spec.model {
            config.model = model.clone();
        }
        if spec.max_turns.is_some() {
            config.max_turns = spec.max_turns;
        }
        config.system = vec![spec.archetype.system_prompt().to_string()];

        let mut agent = Agent::new(
            Arc::clone(&self.client),
            tools,
            Arc::clone(&self.hooks),
            Arc::clone(&self.runtime),
            config,
            self.working_dir.clone(),
        )
        .with_cancel(cancel);

        debug!(worker = %spec.name, session = %agent.session().id, "worker starting");

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let run = agent.run(vec![Message::user(spec.prompt.clone())], tx);
        let collect = async {
            let mut output = String::new();
            let mut stop_reason = None;
            while let Some(event) = rx.recv().await {
                match event {
                    AgentEvent::Text { text } => output.push_str(&text),
                    AgentEvent::Done { stop_reason: sr, .. } => stop_reason = Some(sr),
                    _ => {}
                }
            }
            (output, stop_reason)
        };
        let (run_result, (output, stop_reason)) = tokio::join!(run, collect);

        let final_state = match run_result {
            Err(_) => WorkerState::Failed,
            Ok(()) => match stop_reason {
                Some(StopReason::Cancelled) => WorkerState::Cancelled,
                _ => WorkerState::Completed,
            },
        };
        *state.lock().expect("worker state poisoned") = final_state;

        let _ = self
            .hooks
            .run(
                HookEvent::WorkerStop,
                HookInput {
                    worker_name: Some(spec.name.clone()),
                    ..Default::default()
                },
            )
            .await;

        WorkerOutcome {
            state: final_state,
            output,
        }
    }
}
