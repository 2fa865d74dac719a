use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Roles and stop reasons ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Terminal status of a model turn.
///
/// `EndTurn`, `ToolUse`, and `MaxTokens` are reported by the model;
/// `MaxTurns` and `Cancelled` are imposed by the agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    MaxTurns,
    Cancelled,
}

impl StopReason {
    /// Map a wire stop-reason string to the typed enum.
    ///
    /// Unknown values (including future additions to the API) map to
    /// `EndTurn` so the loop terminates rather than spinning.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            _ => Self::EndTurn,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::MaxTurns => "max_turns",
            Self::Cancelled => "cancelled",
        }
    }
}

// ─── Content blocks ───────────────────────────────────────────────────────────

/// Source descriptor for an image block.  The payload stays base64 — the
/// harness never decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: "base64".into(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

/// Content of a `tool_result` block: a bare string or an array of
/// text/image blocks, matching what tools are allowed to return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ToolResultBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    Text { text: String },
    Image { source: ImageSource },
}

impl ToolResultContent {
    /// Plain-text rendering; image blocks are omitted.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ToolResultBlock::Text { text } => Some(text.as_str()),
                    ToolResultBlock::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Append text to the API-visible content, used when a post-dispatch
    /// hook asks for extra content on the tool result.
    pub fn append_text(&mut self, extra: &str) {
        match self {
            Self::Text(t) => t.push_str(extra),
            Self::Blocks(blocks) => blocks.push(ToolResultBlock::Text { text: extra.into() }),
        }
    }
}

impl From<String> for ToolResultContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ToolResultContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// One element of a message's content array, in the Anthropic wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Extended reasoning.  The signature is an opaque token that must be
    /// echoed back verbatim on later turns; dropping it invalidates the turn.
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: ToolResultContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    /// Server-executed tool invocation — never dispatched locally.
    ServerToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Server-side web search results — opaque pass-through.
    WebSearchToolResult {
        tool_use_id: String,
        content: Value,
    },
    Image {
        source: ImageSource,
    },
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A single message: a role plus an ordered sequence of content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: blocks,
        }
    }

    /// Build the single user message that batches one turn's tool results.
    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: blocks,
        }
    }

    /// Concatenated text of all `text` blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Ids of every `tool_use` block in this message, in order.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Ids referenced by every `tool_result` block in this message.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

// ─── Usage accounting ─────────────────────────────────────────────────────────

/// Token usage, accumulated across turns.  Incoming usage objects may omit
/// any field; missing fields default to zero and unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A tool definition as sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Extended-thinking configuration forwarded with the request.
#[derive(Debug, Clone, PartialEq)]
pub struct ThinkingConfig {
    pub budget_tokens: u32,
}

/// One streaming request to the messages endpoint.
#[derive(Debug, Clone, Default)]
pub struct MessageRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
    /// Caller-provided system content, appended after the protocol-required
    /// prefix block.
    pub system: Vec<String>,
    pub tools: Vec<ToolDefinition>,
    /// Opaque server-side tool definitions appended verbatim after the
    /// typed tool definitions.
    pub extra_tools: Vec<Value>,
    pub thinking: Option<ThinkingConfig>,
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
