// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agentic execution core: session state, the append-only transcript,
//! the turn loop, and nested workers.

mod agent;
mod compact;
mod events;
mod session;
mod worker;
pub mod transcript;

pub use agent::{Agent, AgentConfig};
pub use compact::{should_compact, AutoCompactConfig, Compactor};
pub use events::AgentEvent;
pub use session::Session;
pub use transcript::{
    load as load_transcript, project_dir_name, transcript_dir, AssistantMeta, TranscriptError,
    TranscriptLoad, TranscriptWriter, TruncationInfo,
};
pub use worker::{WorkerArchetype, WorkerManager, WorkerOutcome, WorkerSpec, WorkerState};
