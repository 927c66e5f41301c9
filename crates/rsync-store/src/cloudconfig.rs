//! Credential store for registered clusters
//!
//! Each cluster has either direct credentials (a base64 kubeconfig stored
//! under level "0") or a git-ops descriptor naming the provider type that
//! serves it. Payloads are stored opaquely.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use rsync_common::{Error, Result, CLUSTER_LEVEL};

use crate::kv::{render_key, store_key, InsertMode, KvStore, StoreKey};

/// Collection holding cluster credentials
pub const CLOUD_CONFIG_COLLECTION: &str = "cloudconfig";
/// Collection holding git-ops descriptors
pub const GITOPS_COLLECTION: &str = "gitops";

const CLOUD_CONFIG_KIND: &str = "cloud config";
const GITOPS_KIND: &str = "git-ops descriptor";

/// Credentials for one cluster at one level
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    /// Cluster provider
    pub provider: String,
    /// Cluster name
    pub cluster: String,
    /// "0" for cluster-wide credentials, otherwise namespace scoped
    pub level: String,
    /// Namespace the credential applies to
    pub namespace: String,
    /// Opaque payload (base64 kubeconfig for direct backends)
    pub config: String,
}

/// How a cluster without direct credentials is reached
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsDescriptor {
    /// Backend type (`github`, `azureArcV2`, `fleet`, ...)
    pub provider_type: String,
    /// Backend specific settings (repository url, branch, tokens, ...)
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl GitOpsDescriptor {
    /// A required, non-empty property
    pub fn property(&self, name: &str) -> Result<&str> {
        self.properties
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::configuration(
                    format!("{} descriptor", self.provider_type),
                    format!("missing required property '{name}'"),
                )
            })
    }

    /// An optional property, empty values treated as absent
    pub fn optional(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

fn cloud_key(provider: &str, cluster: &str, level: &str, namespace: &str) -> StoreKey {
    store_key([
        ("provider", provider),
        ("cluster", cluster),
        ("level", level),
        ("namespace", namespace),
    ])
}

fn cluster_key(provider: &str, cluster: &str) -> StoreKey {
    store_key([("provider", provider), ("cluster", cluster)])
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value, kind: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

fn encode<T: Serialize>(value: &T, kind: &str) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

/// Credential store client
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn KvStore>,
}

impl CredentialStore {
    /// Wrap a backing store
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Credentials at `(provider, cluster, level, namespace)`
    pub async fn get(
        &self,
        provider: &str,
        cluster: &str,
        level: &str,
        namespace: &str,
    ) -> Result<CloudConfig> {
        let key = cloud_key(provider, cluster, level, namespace);
        match self.store.get(CLOUD_CONFIG_COLLECTION, &key).await? {
            Some(value) => decode(value, CLOUD_CONFIG_KIND),
            None => Err(Error::not_found(CLOUD_CONFIG_KIND, render_key(&key))),
        }
    }

    /// Cluster-wide credentials, whatever namespace they are registered under
    pub async fn get_cluster_config(&self, provider: &str, cluster: &str) -> Result<CloudConfig> {
        let mut query = cluster_key(provider, cluster);
        query.insert("level".to_string(), CLUSTER_LEVEL.to_string());
        let mut found = self.store.find(CLOUD_CONFIG_COLLECTION, &query).await?;
        match found.pop() {
            Some((_, value)) => decode(value, CLOUD_CONFIG_KIND),
            None => Err(Error::not_found(CLOUD_CONFIG_KIND, render_key(&query))),
        }
    }

    /// Register credentials; fails if the key is taken
    pub async fn create(&self, config: CloudConfig) -> Result<CloudConfig> {
        let key = cloud_key(
            &config.provider,
            &config.cluster,
            &config.level,
            &config.namespace,
        );
        self.store
            .insert(
                CLOUD_CONFIG_COLLECTION,
                key,
                encode(&config, CLOUD_CONFIG_KIND)?,
                InsertMode::Create,
            )
            .await
            .map_err(|e| match e {
                Error::AlreadyExists { key, .. } => Error::already_exists(CLOUD_CONFIG_KIND, key),
                other => other,
            })?;
        debug!(provider = %config.provider, cluster = %config.cluster, level = %config.level, "cloud config created");
        Ok(config)
    }

    /// Remove credentials
    pub async fn delete(
        &self,
        provider: &str,
        cluster: &str,
        level: &str,
        namespace: &str,
    ) -> Result<()> {
        let key = cloud_key(provider, cluster, level, namespace);
        if self.store.remove(CLOUD_CONFIG_COLLECTION, &key).await? {
            Ok(())
        } else {
            Err(Error::not_found(CLOUD_CONFIG_KIND, render_key(&key)))
        }
    }

    /// Namespace of the cluster-wide credential
    pub async fn get_namespace(&self, provider: &str, cluster: &str) -> Result<String> {
        Ok(self.get_cluster_config(provider, cluster).await?.namespace)
    }

    /// Rename the namespace of the cluster-wide credential.
    ///
    /// The rename is a single compare-and-swap on the old key: if another
    /// rename moved the record first, this one fails with `NotFound`.
    pub async fn set_namespace(&self, provider: &str, cluster: &str, namespace: &str) -> Result<()> {
        let mut config = self.get_cluster_config(provider, cluster).await?;
        let old = cloud_key(provider, cluster, CLUSTER_LEVEL, &config.namespace);
        let new = cloud_key(provider, cluster, CLUSTER_LEVEL, namespace);
        config.namespace = namespace.to_string();
        self.store
            .rekey(
                CLOUD_CONFIG_COLLECTION,
                &old,
                new,
                encode(&config, CLOUD_CONFIG_KIND)?,
            )
            .await
    }

    /// Git-ops descriptor of a cluster
    pub async fn get_gitops(&self, provider: &str, cluster: &str) -> Result<GitOpsDescriptor> {
        let key = cluster_key(provider, cluster);
        match self.store.get(GITOPS_COLLECTION, &key).await? {
            Some(value) => decode(value, GITOPS_KIND),
            None => Err(Error::not_found(GITOPS_KIND, render_key(&key))),
        }
    }

    /// Register or replace a git-ops descriptor
    pub async fn put_gitops(
        &self,
        provider: &str,
        cluster: &str,
        descriptor: &GitOpsDescriptor,
    ) -> Result<()> {
        self.store
            .insert(
                GITOPS_COLLECTION,
                cluster_key(provider, cluster),
                encode(descriptor, GITOPS_KIND)?,
                InsertMode::Upsert,
            )
            .await
    }

    /// Remove a git-ops descriptor; false if none was registered
    pub async fn delete_gitops(&self, provider: &str, cluster: &str) -> Result<bool> {
        self.store
            .remove(GITOPS_COLLECTION, &cluster_key(provider, cluster))
            .await
    }
}
