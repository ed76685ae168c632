//! Persistent per-chat inbound watermark and recent-id ring.

use crate::error::Result;
use crate::inflight::store::write_json_atomic;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-`(account, chat)` admission state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundState {
    /// Highest provider create_time successfully processed, epoch ms.
    #[serde(default)]
    pub last_processed_sent_at_ms: i64,
    /// Bounded ring of recently processed message ids, oldest first.
    #[serde(default)]
    pub recent_message_ids: Vec<String>,
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl InboundState {
    pub fn contains(&self, message_id: &str) -> bool {
        self.recent_message_ids.iter().any(|id| id == message_id)
    }

    /// Push a message id, trimming the ring to `limit`.
    pub fn push_recent(&mut self, message_id: &str, limit: usize) {
        self.recent_message_ids.push(message_id.to_string());
        if self.recent_message_ids.len() > limit {
            let excess = self.recent_message_ids.len() - limit;
            self.recent_message_ids.drain(..excess);
        }
    }

    /// Advance the watermark. Never moves backwards.
    pub fn advance_watermark(&mut self, sent_at_ms: i64) {
        self.last_processed_sent_at_ms = self.last_processed_sent_at_ms.max(sent_at_ms);
    }
}

/// File-backed store for inbound state, one file per `(account, chat)`.
pub struct InboundStateStore {
    dir: PathBuf,
    account_id: String,
}

impl InboundStateStore {
    pub fn new(dir: impl Into<PathBuf>, account_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            account_id: account_id.into(),
        }
    }

    /// Chat ids can contain characters unfit for file names, so they are
    /// percent-encoded into the path.
    pub fn path(&self, chat_id: &str) -> PathBuf {
        let encoded = urlencoding::encode(chat_id);
        self.dir
            .join(format!("{}-{}.json", self.account_id, encoded))
    }

    /// Read per-chat state; missing or corrupt files yield the default.
    pub fn read(&self, chat_id: &str) -> InboundState {
        let path = self.path(chat_id);
        read_or_default(&path)
    }

    pub fn write(&self, chat_id: &str, state: &InboundState) -> Result<()> {
        write_json_atomic(&self.path(chat_id), state)
    }
}

fn read_or_default(path: &Path) -> InboundState {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|error| {
            tracing::warn!(%error, path = %path.display(), "corrupt inbound state, starting empty");
            InboundState::default()
        }),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => InboundState::default(),
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "unreadable inbound state, starting empty");
            InboundState::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_trims_to_limit() {
        let mut state = InboundState::default();
        for index in 0..10 {
            state.push_recent(&format!("om_{index}"), 3);
        }
        assert_eq!(state.recent_message_ids, vec!["om_7", "om_8", "om_9"]);
    }

    #[test]
    fn watermark_is_monotone() {
        let mut state = InboundState::default();
        state.advance_watermark(2_000);
        state.advance_watermark(1_000);
        assert_eq!(state.last_processed_sent_at_ms, 2_000);
    }

    #[test]
    fn chat_id_is_encoded_in_path() {
        let store = InboundStateStore::new("/tmp/x", "acc");
        let path = store.path("oc a/b");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "acc-oc%20a%2Fb.json");
    }

    #[test]
    fn round_trip_through_disk() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = InboundStateStore::new(dir.path(), "acc");

        let mut state = InboundState::default();
        state.push_recent("om_1", 250);
        state.advance_watermark(1_234);
        state.updated_at_ms = 5;
        store.write("oc_1", &state).expect("write should succeed");

        let loaded = store.read("oc_1");
        assert_eq!(loaded.last_processed_sent_at_ms, 1_234);
        assert!(loaded.contains("om_1"));
    }
}
