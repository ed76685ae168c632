//! larkgate: a Feishu/Lark chat-bot gateway bridging group chats with an
//! autonomous agent runtime.
//!
//! The core is the provider-to-agent control plane: inbound admission and
//! deduplication, a durable per-anchor-message task lifecycle with reaction
//! status display, a transcript tool-result guard, and a per-destination
//! announce queue for agent-initiated follow-ups.

pub mod agent;
pub mod announce;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod inbound;
pub mod inflight;
pub mod provider;
pub mod reactor;
pub mod transcript;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{GatewayError, Result};

use serde::{Deserialize, Serialize};

/// Whether a chat is a direct conversation or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Direct,
    Group,
}

impl ChatType {
    pub fn is_group(self) -> bool {
        matches!(self, Self::Group)
    }
}

/// A user @-mentioned in an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mention {
    /// Placeholder key inside the message text, e.g. `@_user_1`.
    pub key: String,
    pub open_id: Option<String>,
    pub name: Option<String>,
}

/// A provider message event, parsed into the canonical shape the
/// coordinator works with. Produced by `provider::feishu::parse_message_event`.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub chat_id: String,
    pub message_id: String,
    pub sender_open_id: String,
    pub sender_name: Option<String>,
    pub chat_type: ChatType,
    /// Provider-side creation time, epoch milliseconds.
    pub create_time_ms: i64,
    /// Message text with mention placeholders still embedded.
    pub content: String,
    pub mentions: Vec<Mention>,
    /// Thread root, when the message was sent inside a thread.
    pub root_id: Option<String>,
    /// Message being replied to, when the message is a reply.
    pub parent_id: Option<String>,
}

/// Current epoch time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
