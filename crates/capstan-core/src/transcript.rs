// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only JSONL transcripts with validated resume.
//!
//! One file per session at
//! `<home>/.claude/projects/<cwd-with-slashes-replaced-by-dashes>/<sessionId>.jsonl`,
//! created on first write and never rewritten.  The loader tolerates
//! malformed lines and unknown fields, and truncates the history at the
//! first interrupted tool cycle so a resumed session never starts with a
//! dangling tool_use.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use capstan_model::{ContentBlock, Message, Role, StopReason, Usage};

#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("transcript I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transcript serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("home directory could not be determined")]
    NoHomeDir,
}

/// `/work/space/dir` → `-work-space-dir`, the on-disk project folder name.
pub fn project_dir_name(working_dir: &Path) -> String {
    working_dir
        .to_string_lossy()
        .replace(['/', '\\'], "-")
}

/// Transcript directory for a working dir, under the user's home.
pub fn transcript_dir(working_dir: &Path) -> Result<PathBuf, TranscriptError> {
    let home = dirs::home_dir().ok_or(TranscriptError::NoHomeDir)?;
    Ok(home
        .join(".claude")
        .join("projects")
        .join(project_dir_name(working_dir)))
}

/// Metadata carried on assistant transcript entries.
#[derive(Debug, Clone)]
pub struct AssistantMeta {
    pub model: String,
    pub message_id: String,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
    pub request_id: String,
}

/// Append-only writer for one session's transcript.
pub struct TranscriptWriter {
    path: PathBuf,
    session_id: String,
    cwd: PathBuf,
}

impl TranscriptWriter {
    /// Writer at the canonical location for `(working_dir, session_id)`.
    pub fn for_session(
        working_dir: &Path,
        session_id: &str,
    ) -> Result<Self, TranscriptError> {
        let dir = transcript_dir(working_dir)?;
        Ok(Self::at(
            dir.join(format!("{session_id}.jsonl")),
            working_dir,
            session_id,
        ))
    }

    /// Writer at an explicit path; the canonical layout still applies to
    /// the record contents.
    pub fn at(path: PathBuf, working_dir: &Path, session_id: &str) -> Self {
        Self {
            path,
            session_id: session_id.to_string(),
            cwd: working_dir.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_user(&self, message: &Message) -> Result<(), TranscriptError> {
        let record = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": &message.content,
            },
            "sessionId": self.session_id,
            "timestamp": Utc::now().to_rfc3339(),
            "uuid": Uuid::new_v4().to_string(),
            "cwd": self.cwd.to_string_lossy(),
            "version": env!("CARGO_PKG_VERSION"),
        });
        self.append_line(&record)
    }

    pub fn append_assistant(
        &self,
        message: &Message,
        meta: &AssistantMeta,
    ) -> Result<(), TranscriptError> {
        let record = json!({
            "type": "assistant",
            "message": {
                "role": "assistant",
                "content": &message.content,
                "model": &meta.model,
                "id": &meta.message_id,
                "stop_reason": meta.stop_reason.map(|r| r.as_str()),
                "stop_sequence": &meta.stop_sequence,
                "usage": &meta.usage,
            },
            "requestId": &meta.request_id,
            "sessionId": self.session_id,
            "timestamp": Utc::now().to_rfc3339(),
            "uuid": Uuid::new_v4().to_string(),
            "cwd": self.cwd.to_string_lossy(),
            "version": env!("CARGO_PKG_VERSION"),
        });
        self.append_line(&record)
    }

    fn append_line(&self, record: &Value) -> Result<(), TranscriptError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

// ─── Loading ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TruncationInfo {
    pub truncated: bool,
    pub reason: String,
}

#[derive(Debug)]
pub struct TranscriptLoad {
    pub messages: Vec<Message>,
    pub truncation: Option<TruncationInfo>,
}

/// Load a transcript: parse what parses, keep user/assistant entries, then
/// cut the history at the first broken tool cycle.
pub fn load(path: &Path) -> Result<TranscriptLoad, TranscriptError> {
    let raw = std::fs::read_to_string(path)?;
    let mut parsed: Vec<Message> = Vec::new();

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "skipping malformed transcript line");
                continue;
            }
        };
        let role = match value["type"].as_str() {
            Some("user") => Role::User,
            Some("assistant") => Role::Assistant,
            _ => continue,
        };
        let Some(content) = parse_content(&value["message"]["content"]) else {
            warn!("skipping transcript line with unreadable content");
            continue;
        };
        parsed.push(Message { role, content });
    }

    Ok(validate_tool_cycles(parsed))
}

/// Content is normally a block array; a bare string (older writers) becomes
/// a single text block.
fn parse_content(value: &Value) -> Option<Vec<ContentBlock>> {
    match value {
        Value::String(s) => Some(vec![ContentBlock::Text { text: s.clone() }]),
        Value::Array(_) => serde_json::from_value(value.clone()).ok(),
        _ => None,
    }
}

/// Enforce the pairing invariant: every assistant tool_use must be answered
/// by a matching tool_result in the immediately-following user message, and
/// every tool_result must answer the immediately-preceding assistant.  The
/// history is truncated at the offending assistant message — resuming from
/// a dangling cycle would make the next request invalid.
fn validate_tool_cycles(messages: Vec<Message>) -> TranscriptLoad {
    let mut out: Vec<Message> = Vec::new();

    for (i, message) in messages.iter().enumerate() {
        if message.role == Role::Assistant {
            let ids = message.tool_use_ids();
            if !ids.is_empty() {
                let satisfied = messages.get(i + 1).map_or(false, |next| {
                    let result_ids = next.tool_result_ids();
                    next.role == Role::User
                        && ids.iter().all(|id| result_ids.contains(id))
                });
                if !satisfied {
                    return TranscriptLoad {
                        messages: out,
                        truncation: Some(TruncationInfo {
                            truncated: true,
                            reason: format!(
                                "assistant message {} has tool_use without matching tool_result; \
                                 dropped it and everything after",
                                i
                            ),
                        }),
                    };
                }
            }
        }

        if message.role == Role::User && !message.tool_result_ids().is_empty() {
            let prev_ids: Vec<&str> = out
                .last()
                .filter(|prev| prev.role == Role::Assistant)
                .map(|prev| prev.tool_use_ids())
                .unwrap_or_default();
            let stray = message
                .tool_result_ids()
                .iter()
                .any(|id| !prev_ids.contains(id));
            if stray {
                // Drop the preceding assistant too: the pair is broken on
                // both sides.
                if out.last().map_or(false, |m| m.role == Role::Assistant) {
                    out.pop();
                }
                return TranscriptLoad {
                    messages: out,
                    truncation: Some(TruncationInfo {
                        truncated: true,
                        reason: format!(
                            "user message {} has tool_result without matching tool_use",
                            i
                        ),
                    }),
                };
            }
        }

        out.push(message.clone());
    }

    TranscriptLoad {
        messages: out,
        truncation: None,
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(dir: &Path) -> TranscriptWriter {
        TranscriptWriter::at(dir.join("sess-1.jsonl"), Path::new("/work/project"), "sess-1")
    }

    fn meta() -> AssistantMeta {
        AssistantMeta {
            model: "claude-sonnet-4-5".into(),
            message_id: "msg_01".into(),
            stop_reason: Some(StopReason::EndTurn),
            stop_sequence: None,
            usage: Usage {
                input_tokens: 12,
                output_tokens: 4,
                ..Default::default()
            },
            request_id: "req_01".into(),
        }
    }

    fn tool_use_message(id: &str) -> Message {
        Message::assistant(vec![ContentBlock::ToolUse {
            id: id.into(),
            name: "Read".into(),
            input: serde_json::json!({"file_path": "/tmp/x"}),
        }])
    }

    fn tool_result_message(id: &str) -> Message {
        Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: id.into(),
            content: "42 bytes".into(),
            is_error: None,
        }])
    }

    // ── Path layout ───────────────────────────────────────────────────────────

    #[test]
    fn project_dir_name_replaces_slashes_with_dashes() {
        assert_eq!(
            project_dir_name(Path::new("/home/dev/proj")),
            "-home-dev-proj"
        );
    }

    // ── Record shapes ─────────────────────────────────────────────────────────

    #[test]
    fn user_record_has_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        w.append_user(&Message::user("read /tmp/x")).unwrap();

        let raw = std::fs::read_to_string(w.path()).unwrap();
        let v: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(v["type"], "user");
        assert_eq!(v["message"]["role"], "user");
        assert_eq!(v["sessionId"], "sess-1");
        assert_eq!(v["cwd"], "/work/project");
        assert!(v["timestamp"].as_str().unwrap().contains('T'));
        assert!(v["uuid"].is_string());
        assert!(v["version"].is_string());
    }

    #[test]
    fn assistant_record_carries_model_and_request_id() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        w.append_assistant(
            &Message::assistant(vec![ContentBlock::Text { text: "hi".into() }]),
            &meta(),
        )
        .unwrap();

        let raw = std::fs::read_to_string(w.path()).unwrap();
        let v: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(v["type"], "assistant");
        assert_eq!(v["message"]["model"], "claude-sonnet-4-5");
        assert_eq!(v["message"]["stop_reason"], "end_turn");
        assert_eq!(v["message"]["usage"]["input_tokens"], 12);
        assert_eq!(v["requestId"], "req_01");
    }

    // ── Round-trip and append-only ────────────────────────────────────────────

    #[test]
    fn round_trip_reproduces_history_without_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        let history = vec![
            Message::user("read /tmp/x then report size"),
            tool_use_message("t1"),
            tool_result_message("t1"),
            Message::assistant(vec![ContentBlock::Text {
                text: "42 bytes".into(),
            }]),
        ];
        w.append_user(&history[0]).unwrap();
        w.append_assistant(&history[1], &meta()).unwrap();
        w.append_user(&history[2]).unwrap();
        w.append_assistant(&history[3], &meta()).unwrap();

        let loaded = load(w.path()).unwrap();
        assert!(loaded.truncation.is_none());
        assert_eq!(loaded.messages, history);
    }

    #[test]
    fn loading_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        w.append_user(&Message::user("hello")).unwrap();
        w.append_assistant(
            &Message::assistant(vec![ContentBlock::Text { text: "hi".into() }]),
            &meta(),
        )
        .unwrap();

        let first = load(w.path()).unwrap();
        let second = load(w.path()).unwrap();
        assert_eq!(first.messages, second.messages);
    }

    #[test]
    fn file_length_is_monotonically_nondecreasing() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        let mut last_len = 0u64;
        for i in 0..5 {
            w.append_user(&Message::user(format!("turn {i}"))).unwrap();
            let len = std::fs::metadata(w.path()).unwrap().len();
            assert!(len > last_len);
            last_len = len;
        }
    }

    #[test]
    fn malformed_lines_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        w.append_user(&Message::user("kept")).unwrap();
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(w.path())
                .unwrap();
            writeln!(f, "{{half a record").unwrap();
            writeln!(f, "{{\"type\":\"summary\",\"summary\":\"ignored kind\"}}").unwrap();
        }
        w.append_user(&Message::user("also kept")).unwrap();

        let loaded = load(w.path()).unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert!(loaded.truncation.is_none());
    }

    #[test]
    fn unknown_top_level_fields_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(
            &path,
            "{\"type\":\"user\",\"message\":{\"role\":\"user\",\"content\":\"hi\"},\"futureField\":{\"x\":1}}\n",
        )
        .unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].text(), "hi");
    }

    // ── Tool-cycle validation ─────────────────────────────────────────────────

    #[test]
    fn interrupted_tool_cycle_truncates_last_assistant() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        w.append_user(&Message::user("go")).unwrap();
        w.append_assistant(&tool_use_message("t9"), &meta()).unwrap();
        // Interrupted: no tool_result follows.

        let loaded = load(w.path()).unwrap();
        let truncation = loaded.truncation.expect("must report truncation");
        assert!(truncation.truncated);
        assert_eq!(loaded.messages.len(), 1, "the dangling assistant is dropped");
        assert_eq!(loaded.messages[0].text(), "go");
    }

    #[test]
    fn partial_tool_results_also_truncate() {
        // Two tool_use blocks, only one answered.
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        w.append_user(&Message::user("go")).unwrap();
        let assistant = Message::assistant(vec![
            ContentBlock::ToolUse {
                id: "a".into(),
                name: "Read".into(),
                input: serde_json::json!({}),
            },
            ContentBlock::ToolUse {
                id: "b".into(),
                name: "Bash".into(),
                input: serde_json::json!({}),
            },
        ]);
        w.append_assistant(&assistant, &meta()).unwrap();
        w.append_user(&tool_result_message("a")).unwrap();

        let loaded = load(w.path()).unwrap();
        assert!(loaded.truncation.is_some());
        assert_eq!(loaded.messages.len(), 1);
    }

    #[test]
    fn stray_tool_result_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        w.append_user(&Message::user("go")).unwrap();
        w.append_user(&tool_result_message("ghost")).unwrap();

        let loaded = load(w.path()).unwrap();
        assert!(loaded.truncation.is_some());
        assert_eq!(loaded.messages.len(), 1);
    }

    #[test]
    fn complete_cycles_load_without_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        for i in 0..3 {
            w.append_user(&Message::user(format!("round {i}"))).unwrap();
            w.append_assistant(&tool_use_message(&format!("t{i}")), &meta())
                .unwrap();
            w.append_user(&tool_result_message(&format!("t{i}"))).unwrap();
            w.append_assistant(
                &Message::assistant(vec![ContentBlock::Text { text: "ok".into() }]),
                &meta(),
            )
            .unwrap();
        }
        let loaded = load(w.path()).unwrap();
        assert!(loaded.truncation.is_none());
        assert_eq!(loaded.messages.len(), 12);
    }

    #[test]
    fn thinking_signature_survives_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path());
        let sig = "EqQBCgIYAhIkYm9keQ==";
        let assistant = Message::assistant(vec![
            ContentBlock::Thinking {
                thinking: "reasoning".into(),
                signature: Some(sig.into()),
            },
            ContentBlock::Text { text: "hi".into() },
        ]);
        w.append_user(&Message::user("q")).unwrap();
        w.append_assistant(&assistant, &meta()).unwrap();

        let loaded = load(w.path()).unwrap();
        match &loaded.messages[1].content[0] {
            ContentBlock::Thinking { signature, .. } => {
                assert_eq!(signature.as_deref(), Some(sig));
            }
            other => panic!("wrong block: {other:?}"),
        }
    }
}
