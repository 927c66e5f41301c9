//! Startup seed
//!
//! A YAML document registering clusters, git-ops descriptors and sessions
//! before the daemon starts serving:
//!
//! ```yaml
//! cloudConfigs:
//!   - { provider: aws, cluster: edge, level: "0", namespace: default, config: <base64> }
//! gitops:
//!   - { provider: azure, cluster: east, providerType: github, properties: { url: ..., branch: main } }
//! sessions:
//!   - { id: s1, app: { name: shop, appOrder: [web], apps: { ... } } }
//! ```
//!
//! Records already present are left untouched, so a seed can be replayed
//! against a persistent store on every start.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use rsync_common::{Error, Result};

use crate::cloudconfig::{CloudConfig, CredentialStore, GitOpsDescriptor};
use crate::context::{AppContextStore, SessionRecord};

const SEED_KIND: &str = "seed file";

/// Git-ops descriptor of one cluster
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsSeed {
    /// Cluster provider
    pub provider: String,
    /// Cluster name
    pub cluster: String,
    /// The descriptor itself
    #[serde(flatten)]
    pub descriptor: GitOpsDescriptor,
}

/// Records to register at startup
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    /// Cluster credentials
    #[serde(default)]
    pub cloud_configs: Vec<CloudConfig>,
    /// Git-ops descriptors
    #[serde(default)]
    pub gitops: Vec<GitOpsSeed>,
    /// Deployment sessions
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
}

/// What applying a seed did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Records registered
    pub loaded: usize,
    /// Records left alone because they already existed
    pub skipped: usize,
}

impl Seed {
    /// Parse a seed document
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::serialization_for_kind(SEED_KIND, e.to_string()))
    }

    /// Read and parse a seed file
    pub async fn read(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::internal_with_context(SEED_KIND, format!("{}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Register every record that does not exist yet
    pub async fn apply(
        &self,
        credentials: &CredentialStore,
        sessions: &dyn AppContextStore,
    ) -> Result<SeedReport> {
        let mut report = SeedReport::default();
        for config in &self.cloud_configs {
            match credentials.create(config.clone()).await {
                Ok(_) => report.loaded += 1,
                Err(e) if e.is_already_exists() => {
                    debug!(provider = %config.provider, cluster = %config.cluster, "credentials already registered");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        for seed in &self.gitops {
            match credentials.get_gitops(&seed.provider, &seed.cluster).await {
                Ok(_) => report.skipped += 1,
                Err(e) if e.is_not_found() => {
                    credentials
                        .put_gitops(&seed.provider, &seed.cluster, &seed.descriptor)
                        .await?;
                    report.loaded += 1;
                }
                Err(e) => return Err(e),
            }
        }
        for record in &self.sessions {
            if sessions.exists(&record.id).await? {
                debug!(session = %record.id, "session already registered");
                report.skipped += 1;
            } else {
                sessions.put(record).await?;
                report.loaded += 1;
            }
        }
        info!(loaded = report.loaded, skipped = report.skipped, "seed applied");
        Ok(report)
    }
}
