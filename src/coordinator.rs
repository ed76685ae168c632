//! TaskCoordinator: inbound pipeline, task state machine, boot
//! reconciliation, and outbound auto-finalization.
//!
//! One coordinator runs per gateway account. It owns the process-wide
//! mutable state the control plane needs (dedup caches, sender names,
//! permission-error cooldowns, announce queues), so tests construct fresh
//! instances instead of sharing globals.

mod inbound;
mod lifecycle;
mod reconcile;

pub use reconcile::RECONCILE_MAX_AGE_MS;

use crate::agent::AgentDispatcher;
use crate::announce::AnnounceQueues;
use crate::config::{AnnounceConfig, Config, PolicyConfig};
use crate::history::ChatHistoryBuffer;
use crate::inbound::InboundGate;
use crate::inflight::{InFlightStore, TaskState};
use crate::provider::{Provider, emoji};
use crate::reactor::StatusReactor;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Provider tag stamped on task records.
const PROVIDER_TAG: &str = "feishu";

/// The control plane for one gateway account.
pub struct Coordinator {
    account_id: String,
    provider: Arc<dyn Provider>,
    dispatcher: Arc<dyn AgentDispatcher>,
    reactor: StatusReactor,
    inflight: InFlightStore,
    gate: InboundGate,
    policy: PolicyConfig,
    announce_defaults: AnnounceConfig,
    announces: AnnounceQueues,
    history: Mutex<ChatHistoryBuffer>,
    sender_names: Mutex<HashMap<String, String>>,
    /// Last permission-error notice per app, for the 5-minute cooldown.
    permission_notices: Mutex<HashMap<String, i64>>,
    bot_open_id: Option<String>,
}

impl Coordinator {
    pub fn new(
        config: &Config,
        provider: Arc<dyn Provider>,
        dispatcher: Arc<dyn AgentDispatcher>,
    ) -> Self {
        let state_dir = config.state_dir();
        let account_id = config.feishu.account_id().to_string();
        Self {
            reactor: StatusReactor::new(provider.clone()),
            inflight: InFlightStore::new(
                state_dir.join("feishu").join("inflight"),
                account_id.clone(),
            ),
            gate: InboundGate::new(
                state_dir.join("feishu").join("inbound"),
                account_id.clone(),
                config.stale_drop.clone(),
            ),
            policy: config.policy.clone(),
            announce_defaults: config.announce.clone(),
            announces: AnnounceQueues::new(),
            history: Mutex::new(ChatHistoryBuffer::new(config.history.per_chat_limit)),
            sender_names: Mutex::new(HashMap::new()),
            permission_notices: Mutex::new(HashMap::new()),
            bot_open_id: config.feishu.bot_open_id.clone(),
            account_id,
            provider,
            dispatcher,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn inflight(&self) -> &InFlightStore {
        &self.inflight
    }

    pub fn gate(&self) -> &InboundGate {
        &self.gate
    }

    pub fn announces(&self) -> &AnnounceQueues {
        &self.announces
    }
}

/// The status emoji displayed for each task state.
pub(crate) fn emoji_for_state(state: TaskState) -> &'static str {
    match state {
        TaskState::Received => emoji::GLANCE,
        TaskState::Queued => emoji::ONE_SECOND,
        TaskState::Working => emoji::HAMMER,
        TaskState::Waiting => emoji::ALARM,
        TaskState::Done => emoji::DONE,
        TaskState::Failed | TaskState::Interrupted => emoji::ERROR,
    }
}
