//! Deployment session records

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rsync_common::{CompositeApp, DeploymentState, Error, Result};

use crate::kv::{render_key, store_key, InsertMode, KvStore};

/// Collection holding session records
pub const APP_CONTEXT_COLLECTION: &str = "appcontext";

const APP_CONTEXT_KIND: &str = "app context";

/// A deployment session: its application graph and lifecycle state
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Session id
    pub id: String,
    /// Current lifecycle state
    #[serde(default)]
    pub state: DeploymentState,
    /// Application graph deployed by this session
    pub app: CompositeApp,
}

impl SessionRecord {
    /// A fresh session in `Created`
    pub fn new(id: impl Into<String>, app: CompositeApp) -> Self {
        Self {
            id: id.into(),
            state: DeploymentState::Created,
            app,
        }
    }
}

/// Session persistence
#[async_trait]
pub trait AppContextStore: Send + Sync {
    /// Load a session; `NotFound` if absent
    async fn get(&self, id: &str) -> Result<SessionRecord>;

    /// Store a session, replacing any previous record
    async fn put(&self, record: &SessionRecord) -> Result<()>;

    /// Update only the lifecycle state
    async fn set_state(&self, id: &str, state: DeploymentState) -> Result<()>;

    /// Delete a session; false if it did not exist
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Whether the session still exists
    async fn exists(&self, id: &str) -> Result<bool>;
}

/// Session store backed by a [`KvStore`]
#[derive(Clone)]
pub struct KvContextStore {
    store: Arc<dyn KvStore>,
}

impl KvContextStore {
    /// Wrap a backing store
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AppContextStore for KvContextStore {
    async fn get(&self, id: &str) -> Result<SessionRecord> {
        let key = store_key([("id", id)]);
        match self.store.get(APP_CONTEXT_COLLECTION, &key).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::serialization_for_kind(APP_CONTEXT_KIND, e.to_string())),
            None => Err(Error::not_found(APP_CONTEXT_KIND, render_key(&key))),
        }
    }

    async fn put(&self, record: &SessionRecord) -> Result<()> {
        let value = serde_json::to_value(record)
            .map_err(|e| Error::serialization_for_kind(APP_CONTEXT_KIND, e.to_string()))?;
        self.store
            .insert(
                APP_CONTEXT_COLLECTION,
                store_key([("id", record.id.as_str())]),
                value,
                InsertMode::Upsert,
            )
            .await
    }

    async fn set_state(&self, id: &str, state: DeploymentState) -> Result<()> {
        let mut record = self.get(id).await?;
        record.state = state;
        self.put(&record).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.store
            .remove(APP_CONTEXT_COLLECTION, &store_key([("id", id)]))
            .await
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self
            .store
            .get(APP_CONTEXT_COLLECTION, &store_key([("id", id)]))
            .await?
            .is_some())
    }
}
