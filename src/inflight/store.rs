//! Atomic, file-backed journal of in-flight tasks, one file per account.

use crate::error::Result;
use crate::inflight::types::StoreFile;

use anyhow::Context as _;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// File-backed store for one account's in-flight tasks.
///
/// All mutations follow read-modify-write under the per-store mutex; a crash
/// mid-write leaves the previous committed file intact because writes go to
/// `<path>.tmp` and are renamed into place after fsync.
pub struct InFlightStore {
    dir: PathBuf,
    account_id: String,
    write_lock: Mutex<()>,
}

impl InFlightStore {
    pub fn new(dir: impl Into<PathBuf>, account_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            account_id: account_id.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}-store.json", self.account_id))
    }

    /// Read and parse the store file. Missing or corrupt files yield an
    /// empty store so a bad write can never wedge the gateway.
    pub fn read(&self) -> (PathBuf, StoreFile) {
        let path = self.path();
        let store = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StoreFile>(&raw) {
                Ok(store) => store,
                Err(error) => {
                    tracing::warn!(%error, path = %path.display(), "corrupt inflight store, starting empty");
                    StoreFile::default()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(error) => {
                tracing::warn!(%error, path = %path.display(), "unreadable inflight store, starting empty");
                StoreFile::default()
            }
        };
        (path, store)
    }

    /// Serialize and atomically replace the store file.
    pub fn write(path: &Path, store: &StoreFile) -> Result<()> {
        write_json_atomic(path, store)
    }

    /// Read-modify-write under the store mutex. The closure's return value
    /// is handed back to the caller.
    pub async fn update<R>(&self, mutate: impl FnOnce(&mut StoreFile) -> R) -> Result<R> {
        let _guard = self.write_lock.lock().await;
        let (path, mut store) = self.read();
        let result = mutate(&mut store);
        Self::write(&path, &store)?;
        Ok(result)
    }

    /// Read-only snapshot; no lock needed since writers replace atomically.
    pub fn snapshot(&self) -> StoreFile {
        self.read().1
    }
}

/// Serialize a value to `<path>.tmp`, fsync, and rename over `path`.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create state dir: {}", parent.display()))?;
    }

    let payload = serde_json::to_vec_pretty(value).context("failed to serialize state")?;
    let tmp_path = path.with_extension("json.tmp");

    {
        use std::io::Write as _;
        let mut file = std::fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(&payload)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync {}", tmp_path.display()))?;
    }

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {} into place", tmp_path.display()))?;
    Ok(())
}
