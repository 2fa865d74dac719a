// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Ordered pre/post interceptors for tool calls and worker lifecycle.
//!
//! Handlers run in registration order.  A pre-tool handler may block the
//! dispatch or rewrite the tool input; a post-tool handler may append to the
//! API-visible result.  A handler that returns an error is logged and
//! treated as permissive — observability bugs must not block tool dispatch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    WorkerStart,
    WorkerStop,
}

/// Payload handed to handlers.  Fields are populated per event kind: tool
/// events carry the tool fields, worker events the worker name.
#[derive(Debug, Clone, Default)]
pub struct HookInput {
    pub session_id: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_output: Option<String>,
    pub tool_is_error: Option<bool>,
    pub worker_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HookDecision {
    pub allow: bool,
    pub reason: Option<String>,
    /// Replacement tool input for subsequent handlers and dispatch.
    pub modified: Option<Value>,
    /// Text concatenated onto the API-visible tool result content.
    pub append_to_result: Option<String>,
}

impl Default for HookDecision {
    fn default() -> Self {
        Self {
            allow: true,
            reason: None,
            modified: None,
            append_to_result: None,
        }
    }
}

impl HookDecision {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn modify(input: Value) -> Self {
        Self {
            modified: Some(input),
            ..Self::default()
        }
    }

    pub fn append(text: impl Into<String>) -> Self {
        Self {
            append_to_result: Some(text.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, event: HookEvent, input: &HookInput) -> anyhow::Result<HookDecision>;
}

/// Adapter so plain closures can be registered as hooks.
pub struct FnHook<F>(pub F);

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(HookEvent, &HookInput) -> HookDecision + Send + Sync,
{
    async fn run(&self, event: HookEvent, input: &HookInput) -> anyhow::Result<HookDecision> {
        Ok((self.0)(event, input))
    }
}

/// Folded outcome of a handler chain.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub allowed: bool,
    pub reason: Option<String>,
    /// The tool input after any modifications, when at least one handler
    /// rewrote it.
    pub modified_input: Option<Value>,
    /// Concatenation of every `append_to_result`.
    pub appended: String,
}

impl HookOutcome {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            modified_input: None,
            appended: String::new(),
        }
    }
}

/// Multimap from event kind to ordered handlers.  Registration happens
/// during setup; `run` snapshots the handler list so concurrent mutation
/// cannot invalidate an in-flight iteration.
#[derive(Default)]
pub struct HookRegistry {
    handlers: RwLock<HashMap<HookEvent, Vec<Arc<dyn Hook>>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: HookEvent, hook: Arc<dyn Hook>) {
        self.handlers
            .write()
            .expect("hook registry lock poisoned")
            .entry(event)
            .or_default()
            .push(hook);
    }

    pub fn register_fn<F>(&self, event: HookEvent, f: F)
    where
        F: Fn(HookEvent, &HookInput) -> HookDecision + Send + Sync + 'static,
    {
        self.register(event, Arc::new(FnHook(f)));
    }

    /// Run the handler chain for `event`, folding decisions in order.
    pub async fn run(&self, event: HookEvent, mut input: HookInput) -> HookOutcome {
        let snapshot: Vec<Arc<dyn Hook>> = {
            let map = self.handlers.read().expect("hook registry lock poisoned");
            map.get(&event).cloned().unwrap_or_default()
        };

        let mut outcome = HookOutcome::allowed();
        for hook in snapshot {
            match hook.run(event, &input).await {
                Ok(decision) => {
                    if !decision.allow {
                        return HookOutcome {
                            allowed: false,
                            reason: decision.reason,
                            modified_input: outcome.modified_input,
                            appended: outcome.appended,
                        };
                    }
                    if let Some(modified) = decision.modified {
                        input.tool_input = Some(modified.clone());
                        outcome.modified_input = Some(modified);
                    }
                    if let Some(extra) = decision.append_to_result {
                        outcome.appended.push_str(&extra);
                    }
                }
                Err(e) => {
                    warn!(?event, error = %e, "hook handler failed; treating as allow");
                }
            }
        }
        outcome
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
