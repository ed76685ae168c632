//! Agent runtime collaborator contract.
//!
//! The gateway core drives an external agent through this interface:
//! `dispatch` runs one job from admission to idle, emitting `AgentSignal`s
//! on the channel as the stream progresses. The coordinator listens for the
//! first user-visible reply to flip the status emoji from queued to working.

use crate::ChatType;
use crate::error::Result;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Signals emitted by the dispatcher while a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSignal {
    /// The first user-visible reply of this job started streaming.
    ReplyStart,
}

pub type SignalSender = mpsc::UnboundedSender<AgentSignal>;

/// Outcome reported when the dispatcher goes idle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DispatchOutcome {
    /// A follow-up was queued for later delivery (task should wait).
    #[serde(default)]
    pub queued_final: bool,
    /// Number of final replies delivered during the job.
    #[serde(default)]
    pub final_count: usize,
}

/// The canonical inbound wrapping handed to the agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentEnvelope {
    pub task_id: String,
    pub run_id: String,
    pub account_id: String,
    pub chat_id: String,
    pub chat_type: ChatType,
    pub sender_label: String,
    pub text: String,
    /// Text of the message being replied to, when the inbound quoted one.
    pub quoted_text: Option<String>,
    /// Display names of users the message @-mentions besides the bot.
    pub mention_targets: Vec<String>,
    /// Recent chat context recorded while the bot was not engaged.
    pub chat_context: Option<String>,
    pub timestamp_ms: i64,
}

impl AgentEnvelope {
    /// Render the envelope into the prompt text the agent receives.
    ///
    /// Identifies channel, sender, and timestamp, then layers optional
    /// quoted text, mention hints, and recent chat context above the body.
    pub fn render(&self) -> String {
        let timestamp = chrono::DateTime::from_timestamp_millis(self.timestamp_ms)
            .unwrap_or_else(chrono::Utc::now)
            .format("%Y-%m-%d %H:%M:%S UTC");
        let channel = match self.chat_type {
            ChatType::Direct => "direct message",
            ChatType::Group => "group chat",
        };

        let mut output = format!(
            "[{channel} {} | from {} | {timestamp}]\n",
            self.chat_id, self.sender_label
        );
        if let Some(context) = &self.chat_context {
            output.push_str("[Recent messages in this chat]\n");
            output.push_str(context);
            output.push_str("\n\n");
        }
        if let Some(quoted) = &self.quoted_text {
            output.push_str("[In reply to]\n");
            output.push_str(quoted);
            output.push_str("\n\n");
        }
        if !self.mention_targets.is_empty() {
            output.push_str(&format!(
                "[This message also mentions: {}]\n",
                self.mention_targets.join(", ")
            ));
        }
        output.push_str(&self.text);
        output
    }
}

/// The agent runtime, from the gateway's point of view.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Run one job from admission to dispatcher idle.
    ///
    /// Implementations send `AgentSignal::ReplyStart` on `signals` when the
    /// first user-visible reply begins, and return the outcome at idle.
    async fn dispatch(&self, envelope: AgentEnvelope, signals: SignalSender)
    -> Result<DispatchOutcome>;
}
