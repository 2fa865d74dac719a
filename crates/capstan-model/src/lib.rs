// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Data model and streaming transport for the agentic core.
//!
//! The crate owns three layers: the message/content-block data model in the
//! Anthropic wire shape, the SSE parser plus turn reassembler that rebuild a
//! streamed response into a structured assistant message, and the
//! authenticated streaming transport behind the [`ModelClient`] seam.

pub mod assembly;
pub mod client;
pub mod credentials;
pub mod sse;
mod scripted;
mod types;

pub use assembly::{AssembledTurn, AssemblyEvent, TurnAssembler};
pub use client::{
    build_request_body, AnthropicClient, ModelClient, StreamEventStream, TransportError,
    ANTHROPIC_VERSION, BETA_FEATURES, DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT,
    SYSTEM_PROMPT_PREFIX,
};
pub use credentials::{CredentialSource, StaticCredential};
pub use scripted::{text_turn, tool_use_turn, Script, ScriptedClient};
pub use sse::{BlockDelta, SseParser, StreamEvent};
pub use types::*;
