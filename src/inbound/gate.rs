//! The two-layer inbound admission gate.

use crate::config::StaleDropConfig;
use crate::inbound::dedup::RecentMessageCache;
use crate::inbound::state::InboundStateStore;
use crate::now_ms;

use std::path::PathBuf;
use tokio::sync::Mutex;

/// Outcome of running an event through the persistent gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Accept,
    /// Message id already in the per-chat ring.
    Duplicate,
    /// Provider create_time fell behind the watermark beyond the skew window.
    Stale {
        sent_at_ms: i64,
        last_processed_sent_at_ms: i64,
    },
}

/// Per-account inbound gate: in-memory reconnect-burst dedup plus the
/// persistent per-chat watermark and recent-id ring.
pub struct InboundGate {
    dedup: Mutex<RecentMessageCache>,
    store: InboundStateStore,
    config: StaleDropConfig,
}

impl InboundGate {
    pub fn new(dir: impl Into<PathBuf>, account_id: impl Into<String>, config: StaleDropConfig) -> Self {
        Self {
            dedup: Mutex::new(RecentMessageCache::default()),
            store: InboundStateStore::new(dir, account_id),
            config,
        }
    }

    /// Layer one: the in-memory reconnect-burst dedup. Returns false when
    /// this delivery is a duplicate.
    pub async fn try_record_in_memory(&self, message_id: &str) -> bool {
        self.dedup.lock().await.try_record(message_id)
    }

    /// Layer two: the persistent per-chat gate.
    ///
    /// Accepted ids are pushed into the ring and advance the watermark.
    /// Stale ids are recorded in the ring regardless, so a provider retry
    /// storm cannot re-trigger the stale-notice reply. Persistence is
    /// best-effort: store errors are logged and the event still flows.
    pub async fn check_persistent(
        &self,
        chat_id: &str,
        message_id: &str,
        sent_at_ms: i64,
    ) -> GateDecision {
        let mut state = self.store.read(chat_id);

        if state.contains(message_id) {
            return GateDecision::Duplicate;
        }

        let stale = self.config.enabled
            && sent_at_ms < state.last_processed_sent_at_ms - self.config.skew_window_ms;

        state.push_recent(message_id, self.config.recent_ids_limit);
        if !stale {
            state.advance_watermark(sent_at_ms);
        }
        state.updated_at_ms = now_ms();

        if let Err(error) = self.store.write(chat_id, &state) {
            tracing::warn!(%error, chat_id, "failed to persist inbound state");
        }

        if stale {
            return GateDecision::Stale {
                sent_at_ms,
                last_processed_sent_at_ms: state.last_processed_sent_at_ms,
            };
        }
        GateDecision::Accept
    }

    pub fn state_store(&self) -> &InboundStateStore {
        &self.store
    }

    pub fn config(&self) -> &StaleDropConfig {
        &self.config
    }
}
