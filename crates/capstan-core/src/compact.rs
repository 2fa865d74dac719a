// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Context compaction seam.
//!
//! The core never summarizes on its own: when context pressure crosses the
//! threshold, the caller-supplied [`Compactor`] is handed the full message
//! list and its return value becomes the new history.

use async_trait::async_trait;

use capstan_model::{Message, Usage};

#[derive(Debug, Clone)]
pub struct AutoCompactConfig {
    pub enabled: bool,
    /// Fraction of the context window at which compaction triggers.
    pub threshold: f32,
    pub max_context_tokens: u64,
}

impl Default for AutoCompactConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.80,
            max_context_tokens: 200_000,
        }
    }
}

/// Compaction triggers when this turn's effective input — fresh input
/// tokens, not the cache-served portion — fills the window past the
/// threshold.
pub fn should_compact(config: &AutoCompactConfig, turn_usage: &Usage) -> bool {
    if !config.enabled || config.max_context_tokens == 0 {
        return false;
    }
    let effective = turn_usage
        .input_tokens
        .saturating_sub(turn_usage.cache_read_input_tokens);
    (effective as f32 / config.max_context_tokens as f32) >= config.threshold
}

#[async_trait]
pub trait Compactor: Send + Sync {
    /// Produce the replacement history.
    async fn compact(&self, messages: &[Message]) -> anyhow::Result<Vec<Message>>;
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
