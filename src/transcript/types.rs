//! Role-tagged transcript entries.

use serde::{Deserialize, Serialize};

/// One structured tool invocation inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed tool arguments. Anything that is not a JSON object is
    /// considered malformed and stripped by the guard's sanitizer.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Content block of a tool result. Only text blocks are size-capped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    Text { text: String },
}

impl ToolResultBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> &str {
        match self {
            Self::Text { text } => text,
        }
    }
}

/// One persisted transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TranscriptMessage {
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        tool_call_id: String,
        #[serde(default)]
        is_error: bool,
        /// Set on placeholder results synthesized by the guard.
        #[serde(default)]
        is_synthetic: bool,
        #[serde(default)]
        content: Vec<ToolResultBlock>,
    },
    User {
        text: String,
    },
    System {
        text: String,
    },
}

impl TranscriptMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User { text: text.into() }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::System { text: text.into() }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            is_error: false,
            is_synthetic: false,
            content: vec![ToolResultBlock::text(text)],
        }
    }

    /// Concatenated text of a tool result's blocks; empty for other roles.
    pub fn result_text(&self) -> String {
        match self {
            Self::ToolResult { content, .. } => content
                .iter()
                .map(ToolResultBlock::as_text)
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}
