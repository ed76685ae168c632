//! Provider capability contracts consumed by the gateway core.
//!
//! The coordinator only depends on this trait; the Feishu Open API client in
//! `feishu` implements it, and tests substitute a recording mock.

pub mod feishu;

use crate::error::Result;
use async_trait::async_trait;

/// Status emoji keys understood by the provider.
pub mod emoji {
    /// 👀 — message received.
    pub const GLANCE: &str = "GLANCE";
    /// ⏱ — queued for the agent.
    pub const ONE_SECOND: &str = "ONE_SECOND";
    /// 🔨 — agent is working.
    pub const HAMMER: &str = "HAMMER";
    /// ⏰ — waiting for a follow-up to land.
    pub const ALARM: &str = "ALARM";
    /// ✅ — finished.
    pub const DONE: &str = "DONE";
    /// ⚠ — failed or interrupted.
    pub const ERROR: &str = "ERROR";
    /// Typing indicator, cleaned up during boot reconciliation.
    pub const TYPING: &str = "TYPING";
}

/// One reaction on a provider message, as returned by `list_reactions`.
#[derive(Debug, Clone)]
pub struct ReactionInfo {
    pub reaction_id: String,
    /// `"app"` for reactions added by bots, `"user"` otherwise.
    pub operator_type: String,
}

/// Outbound text message.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Destination chat id.
    pub to: String,
    pub text: String,
    /// Anchor message to reply to, when threading.
    pub reply_to_message_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            text: text.into(),
            reply_to_message_id: None,
        }
    }

    pub fn replying_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to_message_id = Some(message_id.into());
        self
    }
}

/// Result of a successful send.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message_id: String,
    pub chat_id: String,
}

/// A fetched message, used for quoted-message expansion in envelopes.
#[derive(Debug, Clone, Default)]
pub struct FetchedMessage {
    pub text: Option<String>,
    pub sender_open_id: Option<String>,
}

/// Provider capabilities the core depends on.
///
/// `add_reaction` may be idempotent server-side: adding the same emoji to
/// the same message can return the reaction id already present. Callers must
/// not assume a fresh id per call (see `StatusReactor`).
#[async_trait]
pub trait Provider: Send + Sync {
    /// Add a reaction, returning the provider's reaction id.
    async fn add_reaction(&self, message_id: &str, emoji_type: &str) -> Result<String>;

    async fn remove_reaction(&self, message_id: &str, reaction_id: &str) -> Result<()>;

    async fn list_reactions(
        &self,
        message_id: &str,
        emoji_type: &str,
    ) -> Result<Vec<ReactionInfo>>;

    async fn send_message(&self, message: &OutboundMessage) -> Result<SentMessage>;

    /// Fetch a message's content. `Ok(None)` when the message is gone.
    async fn fetch_message(&self, message_id: &str) -> Result<Option<FetchedMessage>>;
}
