//! GitHub-hosted git-ops with Flux
//!
//! The cluster runs Flux against the repository. Each app gets its own
//! GitRepository/Kustomization pair committed under `flux-system/`, pointing
//! at the app directory of its session.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use rsync_common::crd::status_cr_name;
use rsync_common::Result;

use super::{app_dir, flux_config_path, GitOpsCore, GitOpsProvider, SyncConfig};
use crate::provider::{BackendContext, ClientProvider};
use crate::registry::BackendFactory;

/// Backend type of GitHub git-ops
pub const GITHUB_BACKEND: &str = "github";

const FLUX_NAMESPACE: &str = "flux-system";
const SYNC_INTERVAL: &str = "1m";

/// GitRepository and Kustomization that make Flux sync one app directory
pub fn flux_manifests(url: &str, branch: &str, name: &str, path: &str) -> String {
    format!(
        r#"---
apiVersion: source.toolkit.fluxcd.io/v1
kind: GitRepository
metadata:
  name: {name}
  namespace: {FLUX_NAMESPACE}
spec:
  interval: {SYNC_INTERVAL}
  url: {url}
  ref:
    branch: {branch}
---
apiVersion: kustomize.toolkit.fluxcd.io/v1
kind: Kustomization
metadata:
  name: {name}
  namespace: {FLUX_NAMESPACE}
spec:
  interval: {SYNC_INTERVAL}
  path: ./{path}
  prune: true
  sourceRef:
    kind: GitRepository
    name: {name}
"#
    )
}

/// Commits Flux objects next to the desired state
pub struct RepoFluxConfig;

#[async_trait]
impl SyncConfig for RepoFluxConfig {
    async fn apply(&self, core: &GitOpsCore, app: &str) -> Result<()> {
        let session = core.session();
        let manifests = flux_manifests(
            core.repo().url(),
            core.repo().branch(),
            &status_cr_name(session, app),
            &app_dir(core.cluster_dir(), session, app),
        );
        let path = flux_config_path(core.cluster_dir(), session, app);
        core.commit_one(app, path.clone(), Some(manifests)).await?;
        info!(session = %session, app = %app, path = %path, "flux config committed");
        Ok(())
    }

    async fn delete(&self, core: &GitOpsCore, app: &str) -> Result<()> {
        let path = flux_config_path(core.cluster_dir(), core.session(), app);
        core.commit_one(app, path, None).await
    }
}

/// Builds GitHub git-ops providers from descriptors
pub struct GitHubFactory;

#[async_trait]
impl BackendFactory for GitHubFactory {
    async fn build(&self, ctx: BackendContext) -> Result<Arc<dyn ClientProvider>> {
        let core = GitOpsCore::new(&ctx, GITHUB_BACKEND)?;
        Ok(Arc::new(GitOpsProvider::new(core, Box::new(RepoFluxConfig))))
    }
}
