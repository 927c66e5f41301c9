//! The backend capability set and its staging accumulator
//!
//! `create`, `apply` and `delete` only stage work into an [`Accumulator`];
//! nothing is guaranteed to reach the cluster until `commit`. Each backend
//! owns one accumulator variant and rejects the others.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use rsync_common::labels::{deployment_label_value, tag_manifest};
use rsync_common::{ClusterName, Error, ResourceBundleStatus, Result};
use rsync_store::GitOpsDescriptor;

/// Kind of change an accumulator stages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Create; an existing object counts as success
    Create,
    /// Server-side apply; the latest payload wins
    Apply,
    /// Delete; a missing object counts as success
    Delete,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Create => f.write_str("create"),
            OpKind::Apply => f.write_str("apply"),
            OpKind::Delete => f.write_str("delete"),
        }
    }
}

/// How a backend identifies a deployed resource across sessions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityScope {
    /// Same name and kind on the cluster means the same object in every session
    Cluster,
    /// Identity embeds the session id; each session owns its own copy
    Session,
}

/// A resource handed to a backend for staging
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StagedResource {
    /// `name+kind`
    pub name: String,
    /// YAML or JSON manifest
    pub manifest: String,
    /// Approval payload for certificate signing requests
    pub approval: Option<Value>,
}

impl StagedResource {
    /// Stage a manifest without an approval payload
    pub fn new(name: impl Into<String>, manifest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manifest: manifest.into(),
            approval: None,
        }
    }
}

/// One resource that could not be committed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceFailure {
    /// `name+kind`
    pub resource: String,
    /// Why it failed
    pub reason: String,
}

/// Per-resource result of a commit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Resources that reached the cluster (or the repository)
    pub succeeded: Vec<String>,
    /// Resources that did not
    pub failed: Vec<ResourceFailure>,
}

impl CommitReport {
    /// True when nothing failed
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Record a success
    pub fn success(&mut self, resource: impl Into<String>) {
        self.succeeded.push(resource.into());
    }

    /// Record a failure
    pub fn failure(&mut self, resource: impl Into<String>, reason: impl Into<String>) {
        self.failed.push(ResourceFailure {
            resource: resource.into(),
            reason: reason.into(),
        });
    }

    /// Convert failures into a backend error naming the failed resources
    pub fn into_result(self, cluster: &str, backend: &str) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let detail = self
            .failed
            .iter()
            .map(|f| format!("{}: {}", f.resource, f.reason))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::backend(cluster, backend, detail))
    }
}

/// Results of immediate per-resource operations
#[derive(Debug, Default)]
pub struct DirectBatch {
    pub(crate) report: CommitReport,
}

/// Multi-document manifest file for one coherent operation
#[derive(Debug)]
pub struct BatchFile {
    pub(crate) op: OpKind,
    pub(crate) file: tempfile::NamedTempFile,
    pub(crate) resources: Vec<String>,
    pub(crate) approvals: Vec<(String, String, Value)>,
}

/// File changes for one repository commit
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileSet {
    /// Path → new content, or `None` to remove
    pub changes: BTreeMap<String, Option<String>>,
    /// Resources staged into this commit
    pub resources: Vec<String>,
}

/// Pending edits to a fleet bundle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BundleDraft {
    /// Resource file name → content
    pub adds: BTreeMap<String, String>,
    /// Resource file names to drop
    pub removes: BTreeSet<String>,
    /// Resources staged into this draft
    pub resources: Vec<String>,
}

/// Staging state threaded through create/apply/delete into commit
#[derive(Debug)]
pub enum Accumulator {
    /// Direct Kubernetes backend
    Direct(DirectBatch),
    /// Batched-file Kubernetes backend
    Batch(BatchFile),
    /// Git-ops backends
    GitOps(FileSet),
    /// Fleet bundle backend
    Fleet(BundleDraft),
}

impl Accumulator {
    /// Variant name for error messages
    pub fn variant(&self) -> &'static str {
        match self {
            Accumulator::Direct(_) => "direct",
            Accumulator::Batch(_) => "batch",
            Accumulator::GitOps(_) => "gitops",
            Accumulator::Fleet(_) => "fleet",
        }
    }
}

pub(crate) fn wrong_accumulator(backend: &str, acc: &Accumulator) -> Error {
    Error::internal_with_context(
        backend,
        format!("{} accumulator passed to {backend} backend", acc.variant()),
    )
}

/// Receives observed status from cluster watchers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WatchSink: Send + Sync {
    /// Whether the session still exists; watchers stop once it is gone
    async fn session_exists(&self, session: &str) -> Result<bool>;

    /// A status report was observed for an app on a cluster
    async fn observe(&self, session: &str, app: &str, cluster: &str, status: ResourceBundleStatus);
}

/// Credentials resolved for a cluster
#[derive(Clone, Debug)]
pub enum Credentials {
    /// Materialized kubeconfig file
    Kubeconfig(PathBuf),
    /// Git-ops descriptor
    GitOps(GitOpsDescriptor),
}

/// Settings shared by every backend
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    /// Poll interval of the git-ops and fleet status watchers
    pub status_poll_interval: Duration,
    /// Author name of git-ops commits
    pub git_author: String,
    /// Author email of git-ops commits
    pub git_email: String,
    /// Namespace of status objects
    pub status_namespace: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            status_poll_interval: Duration::from_secs(60),
            git_author: "rsync".to_string(),
            git_email: "rsync@localhost".to_string(),
            status_namespace: rsync_common::crd::DEFAULT_STATUS_NAMESPACE.to_string(),
        }
    }
}

/// Everything a backend factory needs to build a provider for one cluster
#[derive(Clone)]
pub struct BackendContext {
    /// Session the provider serves
    pub session: String,
    /// Target cluster
    pub cluster: ClusterName,
    /// Credential level
    pub level: String,
    /// Credential namespace
    pub namespace: String,
    /// Resolved credentials
    pub credentials: Credentials,
    /// Private working directory for this session and cluster
    pub work_dir: PathBuf,
    /// Destination of observed status
    pub sink: Arc<dyn WatchSink>,
    /// Cancelled when the session's connections are torn down
    pub cancel: CancellationToken,
    /// Shared settings
    pub settings: ProviderSettings,
}

impl BackendContext {
    /// The git-ops descriptor, or a configuration error for other credentials
    pub fn descriptor(&self, backend: &str) -> Result<&GitOpsDescriptor> {
        match &self.credentials {
            Credentials::GitOps(d) => Ok(d),
            Credentials::Kubeconfig(_) => Err(Error::configuration(
                backend,
                format!("{} has direct credentials, not a git-ops descriptor", self.cluster),
            )),
        }
    }

    /// The kubeconfig path, or a configuration error for other credentials
    pub fn kubeconfig(&self, backend: &str) -> Result<&PathBuf> {
        match &self.credentials {
            Credentials::Kubeconfig(path) => Ok(path),
            Credentials::GitOps(_) => Err(Error::configuration(
                backend,
                format!("{} has no direct credentials", self.cluster),
            )),
        }
    }
}

/// Capability set every deployment backend implements
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Registered backend type
    fn backend_type(&self) -> &str;

    /// Session this provider serves
    fn session(&self) -> &str;

    /// Target cluster (`provider+cluster`)
    fn cluster(&self) -> &str;

    /// How resources are identified across sessions
    fn identity_scope(&self) -> IdentityScope;

    /// Fresh staging state for one coherent operation
    fn new_accumulator(&self, op: OpKind) -> Result<Accumulator>;

    /// Stage a creation
    async fn create(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator>;

    /// Stage an apply
    async fn apply(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator>;

    /// Stage a deletion
    async fn delete(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator>;

    /// Make everything staged in `acc` take effect
    async fn commit(&self, app: &str, acc: Accumulator) -> Result<CommitReport>;

    /// Current state of a resource as the backend sees it
    async fn get(&self, app: &str, res: &StagedResource) -> Result<Option<Value>>;

    /// Probe the cluster (or repository)
    async fn is_reachable(&self) -> Result<()>;

    /// Stamp the session label onto a manifest
    fn tag_resource(&self, manifest: &str, app: &str) -> Result<String> {
        tag_manifest(manifest, &deployment_label_value(self.session(), app))
    }

    /// Start feeding observed status for `app` into the watch sink
    async fn start_cluster_watcher(&self, app: &str) -> Result<()>;

    /// Install the status object for `app`
    async fn apply_status_cr(&self, app: &str) -> Result<()>;

    /// Remove the status object for `app`
    async fn delete_status_cr(&self, app: &str) -> Result<()>;

    /// Install backend-side sync configuration for `app`
    async fn apply_config(&self, _app: &str) -> Result<()> {
        Ok(())
    }

    /// Remove backend-side sync configuration for `app`
    async fn delete_config(&self, _app: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_report_names_failed_resources() {
        let mut report = CommitReport::default();
        report.success("web+Service");
        report.failure("db+StatefulSet", "forbidden");
        let err = report.into_result("aws+edge", "k8s").unwrap_err();
        assert!(err.to_string().contains("db+StatefulSet: forbidden"));
        assert_eq!(err.cluster(), Some("aws+edge"));
    }

    #[test]
    fn successful_report_passes_through() {
        let mut report = CommitReport::default();
        report.success("web+Service");
        let report = report.into_result("aws+edge", "k8s").unwrap();
        assert_eq!(report.succeeded, vec!["web+Service"]);
    }

    #[test]
    fn wrong_accumulator_is_an_internal_error() {
        let err = wrong_accumulator("github", &Accumulator::Direct(DirectBatch::default()));
        assert!(err.to_string().contains("direct accumulator passed to github backend"));
    }
}
