// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use capstan_model::{Message, Usage};
use uuid::Uuid;

/// Live conversation state for one agent loop.
///
/// The loop is the sole owner of `messages`; everything else reads through
/// accessors or receives clones.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub working_dir: PathBuf,
    pub messages: Vec<Message>,
    /// Usage accumulated across every turn of this session.
    pub usage: Usage,
}

impl Session {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            working_dir: working_dir.into(),
            messages: Vec::new(),
            usage: Usage::default(),
        }
    }

    pub fn with_id(working_dir: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            working_dir: working_dir.into(),
            messages: Vec::new(),
            usage: Usage::default(),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn add_usage(&mut self, usage: &Usage) {
        self.usage.add(usage);
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
