//! Transcript persistence sinks.

use crate::error::Result;
use crate::transcript::types::TranscriptMessage;

use anyhow::Context as _;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;

/// Something that persists transcript entries, append-only.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn append(&self, message: TranscriptMessage) -> Result<()>;

    /// Path of the backing file, when there is one.
    fn session_file(&self) -> Option<PathBuf> {
        None
    }
}

/// Append-only JSONL session file, one entry per line.
pub struct JsonlSession {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSession {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl SessionSink for JsonlSession {
    async fn append(&self, message: TranscriptMessage) -> Result<()> {
        let mut line = serde_json::to_string(&message).context("failed to serialize entry")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create session dir: {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open session file: {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    fn session_file(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}
