//! Event types for the subprocess NDJSON stream protocol.
//!
//! Each struct mirrors the wire shape of one event variant. Fields without a
//! `#[serde(default)]` are mandatory: a line that omits them does not match
//! the variant and degrades to [`StreamEvent::Unrecognized`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// A validated event parsed from one line of subprocess output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    SystemInit(SystemInit),
    User(UserMessage),
    Assistant(AssistantMessage),
    Result(SessionResult),
    Error(ErrorEvent),
    /// Any object with a string `type` that matched none of the known shapes.
    Unrecognized {
        event_type: String,
        payload: Map<String, Value>,
    },
}

impl StreamEvent {
    /// The wire discriminant this event was parsed from.
    pub fn event_type(&self) -> &str {
        match self {
            Self::SystemInit(_) => "system",
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
            Self::Unrecognized { event_type, .. } => event_type,
        }
    }

    /// Session id carried by the event, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SystemInit(init) => Some(&init.session_id),
            Self::User(msg) => msg.session_id.as_deref(),
            Self::Assistant(msg) => msg.session_id.as_deref(),
            Self::Result(result) => result.session_id.as_deref(),
            Self::Error(err) => err.session_id.as_deref(),
            Self::Unrecognized { payload, .. } => payload.get("session_id").and_then(Value::as_str),
        }
    }

    /// Whether this event marks the end of a session's output.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_))
    }
}

/// Session initialization event (`type: "system"`, `subtype: "init"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInit {
    #[serde(default)]
    pub subtype: Option<String>,
    pub session_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub api_version: Option<String>,
}

/// User turn, usually echoing tool results back into the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub message: MessageBody,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

/// Assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub message: MessageBody,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

impl AssistantMessage {
    /// Concatenated text of all text blocks in the message.
    pub fn text(&self) -> String {
        self.message.content.text()
    }
}

/// Inner `message` object shared by user and assistant events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub content: MessageContent,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Message content is either a bare string or a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Content block within a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Token usage statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// Session completion result (`type: "result"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub duration_api_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Error reported by the subprocess on its output stream (`type: "error"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error: ErrorDetail,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ErrorEvent {
    pub fn message(&self) -> &str {
        match &self.error {
            ErrorDetail::Message(m) => m,
            ErrorDetail::Detailed { message, .. } => message,
        }
    }
}

/// Error payload: plain string or an object with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetail {
    Message(String),
    Detailed {
        message: String,
        #[serde(default, rename = "type")]
        kind: Option<String>,
    },
}
