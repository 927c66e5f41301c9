//! Batched-file backend
//!
//! Staged manifests are written to one temporary multi-document file per
//! accumulator. The accumulator is bound to a single operation kind; commit
//! applies the documents in order and stops at the first failure.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rsync_common::{Error, Result};

use super::watch::{spawn_status_watcher, StatusWatch};
use super::{KubeTarget, BATCH_BACKEND};
use crate::provider::{
    wrong_accumulator, Accumulator, BackendContext, BatchFile, ClientProvider, CommitReport,
    IdentityScope, OpKind, ProviderSettings, StagedResource, WatchSink,
};

const DOCUMENT_MARKER: &str = "---";

impl BatchFile {
    /// Empty batch for `op`, backed by a file in `dir`
    pub fn new(op: OpKind, dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::internal_with_context("batch file", format!("{}: {e}", dir.display()))
        })?;
        let file = tempfile::Builder::new()
            .prefix("batch-")
            .suffix(".yaml")
            .tempfile_in(dir)
            .map_err(|e| Error::internal_with_context("batch file", e.to_string()))?;
        Ok(Self {
            op,
            file,
            resources: Vec::new(),
            approvals: Vec::new(),
        })
    }

    /// Operation this batch was created for
    pub fn op(&self) -> OpKind {
        self.op
    }

    /// Append one manifest as its own document
    pub fn push(&mut self, op: OpKind, resource: &str, manifest: &str) -> Result<()> {
        if op != self.op {
            return Err(Error::internal_with_context(
                BATCH_BACKEND,
                format!("cannot {op} {resource} in a {} batch", self.op),
            ));
        }
        let file = self.file.as_file_mut();
        writeln!(file, "{DOCUMENT_MARKER}")
            .and_then(|_| file.write_all(manifest.trim_end().as_bytes()))
            .and_then(|_| writeln!(file))
            .map_err(|e| Error::internal_with_context("batch file", e.to_string()))?;
        self.resources.push(resource.to_string());
        Ok(())
    }

    /// Staged documents, in staging order, paired with their resource names
    pub fn documents(&self) -> Result<Vec<(String, Value)>> {
        let text = std::fs::read_to_string(self.file.path())
            .map_err(|e| Error::internal_with_context("batch file", e.to_string()))?;
        let docs = rsync_common::yaml::parse_documents(&text)?;
        if docs.len() != self.resources.len() {
            return Err(Error::internal_with_context(
                "batch file",
                format!(
                    "{} documents staged for {} resources",
                    docs.len(),
                    self.resources.len()
                ),
            ));
        }
        Ok(self.resources.iter().cloned().zip(docs).collect())
    }
}

/// Applies a whole batch file per commit
pub struct BatchProvider {
    session: String,
    cluster: String,
    target: Arc<KubeTarget>,
    work_dir: std::path::PathBuf,
    sink: Arc<dyn WatchSink>,
    cancel: CancellationToken,
    settings: ProviderSettings,
}

impl BatchProvider {
    /// Build from a resolved context
    pub fn new(ctx: BackendContext, target: Arc<KubeTarget>) -> Self {
        Self {
            session: ctx.session,
            cluster: ctx.cluster.to_string(),
            target,
            work_dir: ctx.work_dir,
            sink: ctx.sink,
            cancel: ctx.cancel,
            settings: ctx.settings,
        }
    }

    fn stage(
        &self,
        acc: Accumulator,
        op: OpKind,
        app: &str,
        res: &StagedResource,
    ) -> Result<Accumulator> {
        let Accumulator::Batch(mut batch) = acc else {
            return Err(wrong_accumulator(BATCH_BACKEND, &acc));
        };
        let manifest = match op {
            OpKind::Delete => res.manifest.clone(),
            OpKind::Create | OpKind::Apply => self.tag_resource(&res.manifest, app)?,
        };
        batch.push(op, &res.name, &manifest)?;
        if op == OpKind::Apply {
            if let Some(approval) = &res.approval {
                batch
                    .approvals
                    .push((res.name.clone(), manifest, approval.clone()));
            }
        }
        Ok(Accumulator::Batch(batch))
    }

    async fn run_document(&self, op: OpKind, doc: &Value) -> Result<()> {
        let manifest =
            serde_json::to_string(doc).map_err(|e| Error::serialization(e.to_string()))?;
        match op {
            OpKind::Create => self.target.create_manifest(&manifest).await?,
            OpKind::Apply => self.target.apply_manifest(&manifest).await?,
            OpKind::Delete => self.target.delete_manifest(&manifest).await?,
        };
        Ok(())
    }
}

#[async_trait]
impl ClientProvider for BatchProvider {
    fn backend_type(&self) -> &str {
        BATCH_BACKEND
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

    fn new_accumulator(&self, op: OpKind) -> Result<Accumulator> {
        Ok(Accumulator::Batch(BatchFile::new(op, &self.work_dir)?))
    }

    async fn create(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator> {
        self.stage(acc, OpKind::Create, app, res)
    }

    async fn apply(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator> {
        self.stage(acc, OpKind::Apply, app, res)
    }

    async fn delete(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator> {
        self.stage(acc, OpKind::Delete, app, res)
    }

    async fn commit(&self, app: &str, acc: Accumulator) -> Result<CommitReport> {
        let Accumulator::Batch(batch) = acc else {
            return Err(wrong_accumulator(BATCH_BACKEND, &acc));
        };
        let op = batch.op();
        let documents = batch.documents()?;
        debug!(cluster = %self.cluster, app = %app, op = %op, count = documents.len(), "committing batch");

        let mut report = CommitReport::default();
        let mut documents = documents.into_iter();
        for (resource, doc) in documents.by_ref() {
            match self.run_document(op, &doc).await {
                Ok(()) => report.success(resource),
                Err(e) => {
                    warn!(cluster = %self.cluster, resource = %resource, op = %op, error = %e, "batch commit failed");
                    report.failure(resource, e.to_string());
                    break;
                }
            }
        }
        for (resource, _) in documents {
            report.failure(resource, "not attempted: earlier document in batch failed");
        }

        if report.is_success() {
            for (resource, manifest, approval) in &batch.approvals {
                if let Err(e) = self.target.approve(manifest, approval).await {
                    report.succeeded.retain(|r| r != resource);
                    report.failure(resource, format!("approval failed: {e}"));
                }
            }
        }
        Ok(report)
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
