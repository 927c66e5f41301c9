//! File-backed key/value store
//!
//! Records are served from memory. Every write rewrites a JSON snapshot of
//! all collections into a sibling temporary file and renames it over the
//! store file, so a crash leaves either the old or the new snapshot.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use rsync_common::{Error, Result};

use crate::kv::{InsertMode, KvStore, MemoryStore, StoreKey};

const STORE_FILE_KIND: &str = "store file";

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    collection: String,
    key: StoreKey,
    value: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    records: Vec<Entry>,
}

fn io_error(path: &Path, e: std::io::Error) -> Error {
    Error::internal_with_context(STORE_FILE_KIND, format!("{}: {e}", path.display()))
}

/// Store persisted to a JSON file
pub struct FileStore {
    path: PathBuf,
    records: MemoryStore,
    writes: Mutex<()>,
}

impl FileStore {
    /// Open the store at `path`; a missing file starts empty
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)
                .map_err(|e| Error::serialization_for_kind(STORE_FILE_KIND, e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(io_error(&path, e)),
        };
        info!(path = %path.display(), records = snapshot.records.len(), "store file opened");
        let records = MemoryStore::from_records(
            snapshot
                .records
                .into_iter()
                .map(|e| (e.collection, e.key, e.value)),
        );
        Ok(Self {
            path,
            records,
            writes: Mutex::new(()),
        })
    }

    /// Location of the snapshot
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = Snapshot {
            records: self
                .records
                .records()
                .await
                .into_iter()
                .map(|(collection, key, value)| Entry {
                    collection,
                    key,
                    value,
                })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| Error::serialization_for_kind(STORE_FILE_KIND, e.to_string()))?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error(dir, e))?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        debug!(path = %self.path.display(), records = snapshot.records.len(), "store file written");
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn find(&self, collection: &str, key: &StoreKey) -> Result<Vec<(StoreKey, Value)>> {
        self.records.find(collection, key).await
    }

    async fn get(&self, collection: &str, key: &StoreKey) -> Result<Option<Value>> {
        self.records.get(collection, key).await
    }

    async fn insert(
        &self,
        collection: &str,
        key: StoreKey,
        value: Value,
        mode: InsertMode,
    ) -> Result<()> {
        let _write = self.writes.lock().await;
        self.records.insert(collection, key, value, mode).await?;
        self.persist().await
    }

    async fn remove(&self, collection: &str, key: &StoreKey) -> Result<bool> {
        let _write = self.writes.lock().await;
        let removed = self.records.remove(collection, key).await?;
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn rekey(
        &self,
        collection: &str,
        old: &StoreKey,
        new: StoreKey,
        value: Value,
    ) -> Result<()> {
        let _write = self.writes.lock().await;
        self.records.rekey(collection, old, new, value).await?;
        self.persist().await
    }
}
