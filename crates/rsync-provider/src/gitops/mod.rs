//! Git-ops backends
//!
//! Desired state is committed to a repository that an in-cluster agent
//! syncs from; observed state comes back as a status file in the same
//! repository. Resource identity is the file path:
//!
//! ```text
//! clusters/<cluster>/context/<session>/app/<app>/<resource>.yaml   desired
//! clusters/<cluster>/status/<session>-<app>                        observed
//! ```
//!
//! GitHub and Azure Arc share the repository handling here and differ only
//! in how the agent is told to sync the app directory ([`SyncConfig`]).

pub mod azurearc;
pub mod github;

mod git;
mod watcher;

pub use git::{GitRemote, GitRepo};
pub use watcher::{decode_status, watch_status_file, StatusFileSource, StatusFileWatch, WatchExit};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rsync_common::crd::{status_cr_manifest, status_cr_name};
use rsync_common::yaml::parse_document;
use rsync_common::{ClusterName, Result};

use crate::provider::{
    wrong_accumulator, Accumulator, BackendContext, ClientProvider, CommitReport, FileSet,
    IdentityScope, OpKind, ProviderSettings, StagedResource, WatchSink,
};

/// Directory holding everything one app deploys to one cluster
pub fn app_dir(cluster: &str, session: &str, app: &str) -> String {
    format!("clusters/{cluster}/context/{session}/app/{app}")
}

/// Desired-state file of one resource
pub fn resource_path(cluster: &str, session: &str, app: &str, resource: &str) -> String {
    format!("{}/{resource}.yaml", app_dir(cluster, session, app))
}

/// Status file the agent writes for one app
pub fn status_path(cluster: &str, session: &str, app: &str) -> String {
    format!("clusters/{cluster}/status/{session}-{app}")
}

/// File carrying the status object the agent should create
pub fn status_cr_path(cluster: &str, session: &str, app: &str) -> String {
    format!(
        "{}/{}+ResourceBundleState.yaml",
        app_dir(cluster, session, app),
        status_cr_name(session, app)
    )
}

/// Flux objects that sync one app directory
pub fn flux_config_path(cluster: &str, session: &str, app: &str) -> String {
    format!("clusters/{cluster}/flux-system/{session}-{app}.yaml")
}

/// Repository settings read from a git-ops descriptor
pub(crate) fn remote_from_context(ctx: &BackendContext, backend: &str) -> Result<GitRemote> {
    let descriptor = ctx.descriptor(backend)?;
    Ok(GitRemote {
        url: descriptor.property("url")?.to_string(),
        branch: descriptor.property("branch")?.to_string(),
        user: descriptor.optional("userName").unwrap_or_default().to_string(),
        token: descriptor.optional("token").unwrap_or_default().to_string(),
        author: ctx.settings.git_author.clone(),
        email: ctx.settings.git_email.clone(),
    })
}

/// Repository handling shared by every git-ops backend
#[derive(Clone)]
pub struct GitOpsCore {
    backend: &'static str,
    session: String,
    cluster: ClusterName,
    repo: GitRepo,
    sink: Arc<dyn WatchSink>,
    cancel: CancellationToken,
    settings: ProviderSettings,
}

impl GitOpsCore {
    /// Build from a resolved context, mirroring the repository under its working directory
    pub fn new(ctx: &BackendContext, backend: &'static str) -> Result<Self> {
        let remote = remote_from_context(ctx, backend)?;
        let repo = GitRepo::new(
            remote,
            ctx.work_dir.join("repo"),
            &ctx.cluster.to_string(),
            backend,
        );
        Ok(Self {
            backend,
            session: ctx.session.clone(),
            cluster: ctx.cluster.clone(),
            repo,
            sink: ctx.sink.clone(),
            cancel: ctx.cancel.clone(),
            settings: ctx.settings.clone(),
        })
    }

    /// Cluster part of `provider+cluster`, as used in repository paths
    pub fn cluster_dir(&self) -> &str {
        &self.cluster.cluster
    }

    /// Owning session
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Repository mirror
    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }

    fn resource_path(&self, app: &str, resource: &str) -> String {
        resource_path(self.cluster_dir(), &self.session, app, resource)
    }

    fn stage(
        &self,
        acc: Accumulator,
        op: OpKind,
        app: &str,
        res: &StagedResource,
        tagged: Option<String>,
    ) -> Result<Accumulator> {
        let Accumulator::GitOps(mut files) = acc else {
            return Err(wrong_accumulator(self.backend, &acc));
        };
        let path = self.resource_path(app, &res.name);
        let content = match op {
            OpKind::Delete => None,
            OpKind::Create | OpKind::Apply => tagged,
        };
        files.changes.insert(path, content);
        files.resources.push(res.name.clone());
        Ok(Accumulator::GitOps(files))
    }

    /// Push one commit with every staged change
    pub async fn commit_files(&self, app: &str, files: FileSet) -> Result<CommitReport> {
        let mut report = CommitReport::default();
        if files.changes.is_empty() {
            return Ok(report);
        }
        let message = format!("rsync: sync {}/{app} to {}", self.session, self.cluster);
        match self.repo.commit(files.changes, &message).await {
            Ok(commit) => {
                debug!(cluster = %self.cluster, app = %app, commit = ?commit, "git-ops commit done");
                for resource in files.resources {
                    report.success(resource);
                }
            }
            Err(e) => {
                warn!(cluster = %self.cluster, app = %app, error = %e, "git-ops commit failed");
                for resource in files.resources {
                    report.failure(resource, e.to_string());
                }
            }
        }
        Ok(report)
    }

    /// Commit a single file change, failing on any error
    pub async fn commit_one(&self, app: &str, path: String, content: Option<String>) -> Result<()> {
        let name = path.clone();
        let files = FileSet {
            changes: [(path, content)].into_iter().collect(),
            resources: vec![name],
        };
        self.commit_files(app, files)
            .await?
            .into_result(&self.cluster.to_string(), self.backend)
            .map(|_| ())
    }

    fn spawn_watcher(&self, app: &str) {
        let core = self.clone();
        let watch = StatusFileWatch {
            session: self.session.clone(),
            app: app.to_string(),
            cluster: self.cluster.to_string(),
            path: status_path(self.cluster_dir(), &self.session, app),
            interval: self.settings.status_poll_interval,
            sink: self.sink.clone(),
            cancel: self.cancel.child_token(),
        };
        tokio::spawn(async move {
            match watch_status_file(&core.repo, &watch).await {
                Ok(WatchExit::Cancelled) => {
                    debug!(session = %watch.session, app = %watch.app, "status file watcher cancelled");
                }
                Ok(WatchExit::SessionGone) => {
                    info!(session = %watch.session, app = %watch.app, "session deleted, stopping status file watcher");
                    let path = status_cr_path(core.cluster_dir(), &watch.session, &watch.app);
                    if let Err(e) = core.commit_one(&watch.app, path, None).await {
                        warn!(session = %watch.session, app = %watch.app, error = %e, "failed to delete status object");
                    }
                }
                Err(e) => {
                    error!(session = %watch.session, app = %watch.app, cluster = %watch.cluster, error = %e, "status file watcher failed");
                }
            }
        });
    }
}

/// How the in-cluster agent is told to sync an app directory
#[async_trait]
pub trait SyncConfig: Send + Sync {
    /// Install the sync configuration for `app`
    async fn apply(&self, core: &GitOpsCore, app: &str) -> Result<()>;

    /// Remove the sync configuration for `app`
    async fn delete(&self, core: &GitOpsCore, app: &str) -> Result<()>;
}

/// A git-ops backend: shared repository handling plus a sync configurator
pub struct GitOpsProvider {
    backend: &'static str,
    cluster: String,
    core: GitOpsCore,
    config: Box<dyn SyncConfig>,
}

impl GitOpsProvider {
    /// Combine the repository handling with a sync configurator
    pub fn new(core: GitOpsCore, config: Box<dyn SyncConfig>) -> Self {
        Self {
            backend: core.backend,
            cluster: core.cluster.to_string(),
            core,
            config,
        }
    }
}

#[async_trait]
impl ClientProvider for GitOpsProvider {
    fn backend_type(&self) -> &str {
        self.backend
    }

    fn session(&self) -> &str {
        &self.core.session
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn identity_scope(&self) -> IdentityScope {
        IdentityScope::Session
    }

    fn new_accumulator(&self, _op: OpKind) -> Result<Accumulator> {
        Ok(Accumulator::GitOps(FileSet::default()))
    }

    async fn create(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator> {
        let tagged = self.tag_resource(&res.manifest, app)?;
        self.core.stage(acc, OpKind::Create, app, res, Some(tagged))
    }

    async fn apply(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator> {
        let tagged = self.tag_resource(&res.manifest, app)?;
        self.core.stage(acc, OpKind::Apply, app, res, Some(tagged))
    }

    async fn delete(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator> {
        self.core.stage(acc, OpKind::Delete, app, res, None)
    }

    async fn commit(&self, app: &str, acc: Accumulator) -> Result<CommitReport> {
        let Accumulator::GitOps(files) = acc else {
            return Err(wrong_accumulator(self.backend, &acc));
        };
        self.core.commit_files(app, files).await
    }

    async fn get(&self, app: &str, res: &StagedResource) -> Result<Option<Value>> {
        let path = self.core.resource_path(app, &res.name);
        match self.core.repo.read_file(&path).await? {
            Some(text) => parse_document(&text).map(Some),
            None => Ok(None),
        }
    }

    async fn is_reachable(&self) -> Result<()> {
        self.core.repo.probe().await
    }

    async fn start_cluster_watcher(&self, app: &str) -> Result<()> {
        self.core.spawn_watcher(app);
        Ok(())
    }

    async fn apply_status_cr(&self, app: &str) -> Result<()> {
        let core = &self.core;
        let manifest = status_cr_manifest(&core.session, app, &core.settings.status_namespace)?;
        let path = status_cr_path(core.cluster_dir(), &core.session, app);
        core.commit_one(app, path, Some(manifest)).await
    }

    async fn delete_status_cr(&self, app: &str) -> Result<()> {
        let path = status_cr_path(self.core.cluster_dir(), &self.core.session, app);
        self.core.commit_one(app, path, None).await
    }

    async fn apply_config(&self, app: &str) -> Result<()> {
        self.config.apply(&self.core, app).await
    }

    async fn delete_config(&self, app: &str) -> Result<()> {
        self.config.delete(&self.core, app).await
    }
}
