//! Shared test doubles: a recording provider, a scriptable agent
//! dispatcher, and an in-memory session sink.

use crate::agent::{AgentDispatcher, AgentEnvelope, AgentSignal, DispatchOutcome, SignalSender};
use crate::error::{GatewayError, Result};
use crate::provider::{FetchedMessage, OutboundMessage, Provider, ReactionInfo, SentMessage};
use crate::transcript::session::SessionSink;
use crate::transcript::types::TranscriptMessage;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct MockProviderState {
    added: Vec<(String, String, String)>,
    removed: Vec<String>,
    sent: Vec<OutboundMessage>,
    listed: HashMap<String, Vec<ReactionInfo>>,
    fetchable: HashMap<String, FetchedMessage>,
    fixed_reaction_id: Option<String>,
    fail_add: bool,
    fail_remove: bool,
    fail_send: bool,
    next_reaction: u64,
}

/// Provider double that records every call.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockProviderState>,
}

impl MockProvider {
    /// Emoji types added to a message, in order.
    pub async fn added_emojis(&self, message_id: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .added
            .iter()
            .filter(|(id, _, _)| id == message_id)
            .map(|(_, emoji, _)| emoji.clone())
            .collect()
    }

    pub async fn removed_reactions(&self) -> Vec<String> {
        self.state.lock().await.removed.clone()
    }

    pub async fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.sent.clone()
    }

    pub async fn set_fixed_reaction_id(&self, reaction_id: &str) {
        self.state.lock().await.fixed_reaction_id = Some(reaction_id.to_string());
    }

    pub async fn fail_add_reaction(&self) {
        self.state.lock().await.fail_add = true;
    }

    pub async fn fail_remove_reaction(&self) {
        self.state.lock().await.fail_remove = true;
    }

    pub async fn set_listed_reactions(&self, message_id: &str, reactions: Vec<ReactionInfo>) {
        self.state
            .lock()
            .await
            .listed
            .insert(message_id.to_string(), reactions);
    }

    pub async fn set_fetchable(&self, message_id: &str, fetched: FetchedMessage) {
        self.state
            .lock()
            .await
            .fetchable
            .insert(message_id.to_string(), fetched);
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn add_reaction(&self, message_id: &str, emoji_type: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.fail_add {
            return Err(GatewayError::Provider("add_reaction failed".into()));
        }
        let reaction_id = match &state.fixed_reaction_id {
            Some(fixed) => fixed.clone(),
            None => {
                state.next_reaction += 1;
                format!("r_{}", state.next_reaction)
            }
        };
        state
            .added
            .push((message_id.to_string(), emoji_type.to_string(), reaction_id.clone()));
        Ok(reaction_id)
    }

    async fn remove_reaction(&self, _message_id: &str, reaction_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_remove {
            return Err(GatewayError::Provider("remove_reaction failed".into()));
        }
        state.removed.push(reaction_id.to_string());
        Ok(())
    }

    async fn list_reactions(
        &self,
        message_id: &str,
        _emoji_type: &str,
    ) -> Result<Vec<ReactionInfo>> {
        Ok(self
            .state
            .lock()
            .await
            .listed
            .get(message_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, message: &OutboundMessage) -> Result<SentMessage> {
        let mut state = self.state.lock().await;
        if state.fail_send {
            return Err(GatewayError::Provider("send_message failed".into()));
        }
        state.sent.push(message.clone());
        Ok(SentMessage {
            message_id: format!("om_sent_{}", state.sent.len()),
            chat_id: message.to.clone(),
        })
    }

    async fn fetch_message(&self, message_id: &str) -> Result<Option<FetchedMessage>> {
        Ok(self.state.lock().await.fetchable.get(message_id).cloned())
    }
}

#[derive(Default)]
struct MockDispatcherState {
    dispatched: Vec<AgentEnvelope>,
    outcome: DispatchOutcome,
    fail: bool,
    emit_reply_start: bool,
}

/// Agent dispatcher double with a scriptable outcome.
#[derive(Default)]
pub struct MockDispatcher {
    state: Mutex<MockDispatcherState>,
}

impl MockDispatcher {
    /// Dispatcher that reports one final reply per job.
    pub fn replying() -> Self {
        let dispatcher = Self::default();
        {
            let mut state = dispatcher.state.try_lock().expect("fresh mutex");
            state.outcome = DispatchOutcome {
                queued_final: false,
                final_count: 1,
            };
            state.emit_reply_start = true;
        }
        dispatcher
    }

    pub async fn set_outcome(&self, outcome: DispatchOutcome) {
        self.state.lock().await.outcome = outcome;
    }

    pub async fn set_emit_reply_start(&self, emit: bool) {
        self.state.lock().await.emit_reply_start = emit;
    }

    pub async fn fail_dispatch(&self) {
        self.state.lock().await.fail = true;
    }

    pub async fn dispatch_count(&self) -> usize {
        self.state.lock().await.dispatched.len()
    }

    pub async fn dispatched(&self) -> Vec<AgentEnvelope> {
        self.state.lock().await.dispatched.clone()
    }
}

#[async_trait]
impl AgentDispatcher for MockDispatcher {
    async fn dispatch(
        &self,
        envelope: AgentEnvelope,
        signals: SignalSender,
    ) -> Result<DispatchOutcome> {
        let mut state = self.state.lock().await;
        state.dispatched.push(envelope);
        if state.emit_reply_start {
            let _ = signals.send(AgentSignal::ReplyStart);
        }
        if state.fail {
            return Err(GatewayError::Dispatch("scripted failure".into()));
        }
        Ok(state.outcome)
    }
}

/// In-memory transcript sink with entry inspection.
#[derive(Default)]
pub struct MemorySession {
    entries: Mutex<Vec<TranscriptMessage>>,
}

impl MemorySession {
    pub async fn entries(&self) -> Vec<TranscriptMessage> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl SessionSink for MemorySession {
    async fn append(&self, message: TranscriptMessage) -> Result<()> {
        self.entries.lock().await.push(message);
        Ok(())
    }
}
