//! Direct-apply backend
//!
//! Every staged operation hits the API server immediately. Failures are
//! recorded per resource and surface in the commit report; earlier
//! successes are not rolled back.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rsync_common::{Error, Result};

use super::watch::{spawn_status_watcher, StatusWatch};
use super::{KubeTarget, DIRECT_BACKEND};
use crate::provider::{
    wrong_accumulator, Accumulator, BackendContext, ClientProvider, CommitReport, DirectBatch,
    IdentityScope, OpKind, ProviderSettings, StagedResource, WatchSink,
};

/// Applies resources one by one through the Kubernetes API
pub struct DirectProvider {
    session: String,
    cluster: String,
    target: Arc<KubeTarget>,
    sink: Arc<dyn WatchSink>,
    cancel: CancellationToken,
    settings: ProviderSettings,
}

impl DirectProvider {
    /// Build from a resolved context
    pub fn new(ctx: BackendContext, target: Arc<KubeTarget>) -> Self {
        Self {
            session: ctx.session,
            cluster: ctx.cluster.to_string(),
            target,
            sink: ctx.sink,
            cancel: ctx.cancel,
            settings: ctx.settings,
        }
    }

    fn batch(&self, acc: Accumulator) -> Result<DirectBatch> {
        match acc {
            Accumulator::Direct(batch) => Ok(batch),
            other => Err(wrong_accumulator(DIRECT_BACKEND, &other)),
        }
    }

    fn record(&self, batch: &mut DirectBatch, op: OpKind, res: &StagedResource, outcome: Result<()>) {
        match outcome {
            Ok(()) => batch.report.success(&res.name),
            Err(e) => {
                warn!(cluster = %self.cluster, resource = %res.name, op = %op, error = %e, "resource operation failed");
                batch.report.failure(&res.name, e.to_string());
            }
        }
    }
}

#[async_trait]
impl ClientProvider for DirectProvider {
    fn backend_type(&self) -> &str {
        DIRECT_BACKEND
    }

    fn session(&self) -> &str {
        &self.session
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn identity_scope(&self) -> IdentityScope {
        IdentityScope::Cluster
    }

    fn new_accumulator(&self, _op: OpKind) -> Result<Accumulator> {
        Ok(Accumulator::Direct(DirectBatch::default()))
    }

    async fn create(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator> {
        let mut batch = self.batch(acc)?;
        let outcome = async {
            let manifest = self.tag_resource(&res.manifest, app)?;
            self.target.create_manifest(&manifest).await.map(|_| ())
        }
        .await;
        self.record(&mut batch, OpKind::Create, res, outcome);
        Ok(Accumulator::Direct(batch))
    }

    async fn apply(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator> {
        let mut batch = self.batch(acc)?;
        let outcome = async {
            let manifest = self.tag_resource(&res.manifest, app)?;
            self.target.apply_manifest(&manifest).await?;
            if let Some(approval) = &res.approval {
                self.target.approve(&manifest, approval).await?;
            }
            Ok::<(), Error>(())
        }
        .await;
        self.record(&mut batch, OpKind::Apply, res, outcome);
        Ok(Accumulator::Direct(batch))
    }

    async fn delete(&self, acc: Accumulator, _app: &str, res: &StagedResource) -> Result<Accumulator> {
        let mut batch = self.batch(acc)?;
        let outcome = self.target.delete_manifest(&res.manifest).await.map(|_| ());
        self.record(&mut batch, OpKind::Delete, res, outcome);
        Ok(Accumulator::Direct(batch))
    }

    async fn commit(&self, _app: &str, acc: Accumulator) -> Result<CommitReport> {
        Ok(self.batch(acc)?.report)
    }

    async fn get(&self, _app: &str, res: &StagedResource) -> Result<Option<Value>> {
        self.target.get_manifest(&res.manifest).await
    }

    async fn is_reachable(&self) -> Result<()> {
        self.target.probe().await
    }

    async fn start_cluster_watcher(&self, app: &str) -> Result<()> {
        spawn_status_watcher(
            self.target.clone(),
            StatusWatch {
                session: self.session.clone(),
                app: app.to_string(),
                cluster: self.cluster.clone(),
                namespace: self.settings.status_namespace.clone(),
                sink: self.sink.clone(),
                cancel: self.cancel.child_token(),
                session_check_interval: self.settings.status_poll_interval,
            },
        );
        Ok(())
    }

    async fn apply_status_cr(&self, app: &str) -> Result<()> {
        self.target
            .apply_status_cr(&self.session, app, &self.settings.status_namespace)
            .await
    }

    async fn delete_status_cr(&self, app: &str) -> Result<()> {
        self.target
            .delete_status_cr(&self.session, app, &self.settings.status_namespace)
            .await
    }
}
