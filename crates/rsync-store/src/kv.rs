//! Key/value store contract
//!
//! Records live in named collections, addressed by a composite key of
//! attribute/value pairs. `find` matches on a subset of the key attributes,
//! so callers can look a record up without knowing every key part.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use rsync_common::{Error, Result};

/// Composite record key: attribute name → value
pub type StoreKey = BTreeMap<String, String>;

/// Build a key from attribute pairs
pub fn store_key<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> StoreKey {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Render a key for log and error messages
pub fn render_key(key: &StoreKey) -> String {
    key.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// How `insert` treats an existing record under the same key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertMode {
    /// Fail with `AlreadyExists`
    Create,
    /// Overwrite
    Upsert,
}

/// Backing store used by the credential and session stores
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Records whose key contains every attribute of `key`
    async fn find(&self, collection: &str, key: &StoreKey) -> Result<Vec<(StoreKey, Value)>>;

    /// Record stored under exactly `key`
    async fn get(&self, collection: &str, key: &StoreKey) -> Result<Option<Value>>;

    /// Store a record
    async fn insert(
        &self,
        collection: &str,
        key: StoreKey,
        value: Value,
        mode: InsertMode,
    ) -> Result<()>;

    /// Remove the record stored under exactly `key`; false if absent
    async fn remove(&self, collection: &str, key: &StoreKey) -> Result<bool>;

    /// Atomically move the record at `old` to `new`, replacing its value.
    ///
    /// Fails with `NotFound` when `old` is absent and with `AlreadyExists`
    /// when a different record already holds `new`.
    async fn rekey(
        &self,
        collection: &str,
        old: &StoreKey,
        new: StoreKey,
        value: Value,
    ) -> Result<()>;
}

type Collection = BTreeMap<StoreKey, Value>;

fn matches(record: &StoreKey, query: &StoreKey) -> bool {
    query.iter().all(|(k, v)| record.get(k) == Some(v))
}

/// In-memory store for the daemon and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding `records`, given as `(collection, key, value)`
    pub(crate) fn from_records(records: impl IntoIterator<Item = (String, StoreKey, Value)>) -> Self {
        let mut collections: HashMap<String, Collection> = HashMap::new();
        for (collection, key, value) in records {
            collections.entry(collection).or_default().insert(key, value);
        }
        Self {
            collections: RwLock::new(collections),
        }
    }

    /// Copy of every record, as `(collection, key, value)`
    pub(crate) async fn records(&self) -> Vec<(String, StoreKey, Value)> {
        let collections = self.collections.read().await;
        collections
            .iter()
            .flat_map(|(name, records)| {
                records
                    .iter()
                    .map(move |(k, v)| (name.clone(), k.clone(), v.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn find(&self, collection: &str, key: &StoreKey) -> Result<Vec<(StoreKey, Value)>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|(k, _)| matches(k, key))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, collection: &str, key: &StoreKey) -> Result<Option<Value>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|records| records.get(key))
            .cloned())
    }

    async fn insert(
        &self,
        collection: &str,
        key: StoreKey,
        value: Value,
        mode: InsertMode,
    ) -> Result<()> {
        let mut collections = self.collections.write().await;
        let records = collections.entry(collection.to_string()).or_default();
        if mode == InsertMode::Create && records.contains_key(&key) {
            return Err(Error::already_exists(collection, render_key(&key)));
        }
        records.insert(key, value);
        Ok(())
    }

    async fn remove(&self, collection: &str, key: &StoreKey) -> Result<bool> {
        let mut collections = self.collections.write().await;
        Ok(collections
            .get_mut(collection)
            .and_then(|records| records.remove(key))
            .is_some())
    }

    async fn rekey(
        &self,
        collection: &str,
        old: &StoreKey,
        new: StoreKey,
        value: Value,
    ) -> Result<()> {
        let mut collections = self.collections.write().await;
        let records = collections
            .get_mut(collection)
            .ok_or_else(|| Error::not_found(collection, render_key(old)))?;
        if !records.contains_key(old) {
            return Err(Error::not_found(collection, render_key(old)));
        }
        if &new != old && records.contains_key(&new) {
            return Err(Error::already_exists(collection, render_key(&new)));
        }
        records.remove(old);
        records.insert(new, value);
        Ok(())
    }
}
