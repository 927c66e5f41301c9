//! Fleet bundle backend
//!
//! All resources one app deploys to one cluster live in a single Fleet
//! `Bundle` on the management cluster, named after the session and app.
//! Commit merges the staged edits into the bundle and applies it as one
//! object; Fleet rolls it out to the target cluster and summarizes progress
//! in the bundle status, which the watcher turns into status reports.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rsync_common::crd::status_cr_name;
use rsync_common::kube_utils::{build_api_resource, create_client, dynamic_api, FIELD_MANAGER};
use rsync_common::labels::{deployment_label_value, DEPLOYMENT_LABEL};
use rsync_common::yaml::parse_document;
use rsync_common::{Error, ResourceBundleStatus, Result};

use crate::provider::{
    wrong_accumulator, Accumulator, BackendContext, BundleDraft, ClientProvider, CommitReport,
    IdentityScope, OpKind, ProviderSettings, StagedResource, WatchSink,
};
use crate::registry::BackendFactory;

/// Backend type of the fleet bundle backend
pub const FLEET_BACKEND: &str = "fleet";

const BUNDLE_API_VERSION: &str = "fleet.cattle.io/v1alpha1";
const BUNDLE_KIND: &str = "Bundle";
const DEFAULT_FLEET_NAMESPACE: &str = "fleet-default";
const KUBECONFIG_FILE: &str = "fleet-kubeconfig";

/// One file of a bundle
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleResource {
    /// File name inside the bundle
    pub name: String,
    /// Manifest text
    #[serde(default)]
    pub content: String,
}

/// File name of a staged resource inside the bundle
pub fn bundle_file(resource: &str) -> String {
    format!("{resource}.yaml")
}

/// Apply staged edits on top of the bundle's current files
pub fn merge_resources(current: Vec<BundleResource>, draft: &BundleDraft) -> Vec<BundleResource> {
    let mut files: BTreeMap<String, String> = current
        .into_iter()
        .map(|r| (r.name, r.content))
        .collect();
    for name in &draft.removes {
        files.remove(name);
    }
    for (name, content) in &draft.adds {
        files.insert(name.clone(), content.clone());
    }
    files
        .into_iter()
        .map(|(name, content)| BundleResource { name, content })
        .collect()
}

/// Full bundle object targeting one downstream cluster
pub fn build_bundle(
    name: &str,
    namespace: &str,
    label: &str,
    target_cluster: &str,
    resources: &[BundleResource],
) -> Value {
    json!({
        "apiVersion": BUNDLE_API_VERSION,
        "kind": BUNDLE_KIND,
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": { DEPLOYMENT_LABEL: label },
        },
        "spec": {
            "resources": resources,
            "targets": [{ "clusterName": target_cluster }],
        }
    })
}

fn bundle_resources(bundle: &Value) -> Vec<BundleResource> {
    bundle
        .pointer("/spec/resources")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Status report synthesized from a bundle's rollout summary.
///
/// Ready once every desired deployment is ready and at least one is desired.
pub fn summary_status(bundle: &Value) -> ResourceBundleStatus {
    let count = |field: &str| {
        bundle
            .pointer(&format!("/status/summary/{field}"))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    };
    let (ready, desired) = (count("ready"), count("desiredReady"));
    ResourceBundleStatus {
        ready: desired > 0 && ready == desired,
        resource_count: i32::try_from(bundle_resources(bundle).len()).unwrap_or(i32::MAX),
        ..Default::default()
    }
}

/// Where bundles are written and which downstream cluster they target
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FleetTarget {
    /// Namespace of bundles on the management cluster
    pub namespace: String,
    /// Downstream cluster name as Fleet knows it
    pub cluster_name: String,
}

/// Stages resources into one bundle per `(session, app)`
pub struct FleetProvider {
    session: String,
    cluster: String,
    client: Client,
    target: FleetTarget,
    sink: Arc<dyn WatchSink>,
    cancel: CancellationToken,
    settings: ProviderSettings,
}

impl FleetProvider {
    /// Provider writing bundles through `client`
    pub fn new(ctx: BackendContext, client: Client, target: FleetTarget) -> Self {
        Self {
            session: ctx.session,
            cluster: ctx.cluster.to_string(),
            client,
            target,
            sink: ctx.sink,
            cancel: ctx.cancel,
            settings: ctx.settings,
        }
    }

    fn api(&self) -> Api<DynamicObject> {
        let ar = build_api_resource(BUNDLE_API_VERSION, BUNDLE_KIND);
        dynamic_api(&self.client, &ar, Some(&self.target.namespace))
    }

    async fn current_bundle(&self, app: &str) -> Result<Option<Value>> {
        let name = status_cr_name(&self.session, app);
        match self.api().get_opt(&name).await? {
            Some(obj) => serde_json::to_value(obj)
                .map(Some)
                .map_err(|e| Error::serialization_for_kind(BUNDLE_KIND, e.to_string())),
            None => Ok(None),
        }
    }

    async fn write_bundle(&self, app: &str, draft: &BundleDraft) -> Result<()> {
        let name = status_cr_name(&self.session, app);
        let current = self
            .current_bundle(app)
            .await?
            .map(|b| bundle_resources(&b))
            .unwrap_or_default();
        let resources = merge_resources(current, draft);

        if resources.is_empty() {
            match self.api().delete(&name, &DeleteParams::default()).await {
                Ok(_) => info!(bundle = %name, "bundle deleted"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        let bundle = build_bundle(
            &name,
            &self.target.namespace,
            &deployment_label_value(&self.session, app),
            &self.target.cluster_name,
            &resources,
        );
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api().patch(&name, &params, &Patch::Apply(&bundle)).await?;
        debug!(bundle = %name, files = resources.len(), "bundle applied");
        Ok(())
    }

    fn stage(&self, acc: Accumulator, op: OpKind, app: &str, res: &StagedResource) -> Result<Accumulator> {
        let Accumulator::Fleet(mut draft) = acc else {
            return Err(wrong_accumulator(FLEET_BACKEND, &acc));
        };
        let file = bundle_file(&res.name);
        match op {
            OpKind::Create | OpKind::Apply => {
                let manifest = self.tag_resource(&res.manifest, app)?;
                draft.removes.remove(&file);
                draft.adds.insert(file, manifest);
            }
            OpKind::Delete => {
                draft.adds.remove(&file);
                draft.removes.insert(file);
            }
        }
        draft.resources.push(res.name.clone());
        Ok(Accumulator::Fleet(draft))
    }
}

#[async_trait]
impl ClientProvider for FleetProvider {
    fn backend_type(&self) -> &str {
        FLEET_BACKEND
    }

    fn session(&self) -> &str {
        &self.session
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn identity_scope(&self) -> IdentityScope {
        IdentityScope::Session
    }

    fn new_accumulator(&self, _op: OpKind) -> Result<Accumulator> {
        Ok(Accumulator::Fleet(BundleDraft::default()))
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
        let Accumulator::Fleet(draft) = acc else {
            return Err(wrong_accumulator(FLEET_BACKEND, &acc));
        };
        let mut report = CommitReport::default();
        if draft.adds.is_empty() && draft.removes.is_empty() {
            return Ok(report);
        }
        match self.write_bundle(app, &draft).await {
            Ok(()) => draft.resources.into_iter().for_each(|r| report.success(r)),
            Err(e) => {
                warn!(cluster = %self.cluster, app = %app, error = %e, "bundle commit failed");
                for resource in draft.resources {
                    report.failure(resource, e.to_string());
                }
            }
        }
        Ok(report)
    }

    async fn get(&self, app: &str, res: &StagedResource) -> Result<Option<Value>> {
        let Some(bundle) = self.current_bundle(app).await? else {
            return Ok(None);
        };
        let file = bundle_file(&res.name);
        bundle_resources(&bundle)
            .into_iter()
            .find(|r| r.name == file)
            .map(|r| parse_document(&r.content))
            .transpose()
    }

    async fn is_reachable(&self) -> Result<()> {
        self.client
            .apiserver_version()
            .await
            .map(|_| ())
            .map_err(|e| Error::unreachable(&self.cluster, e.to_string()))
    }

    async fn start_cluster_watcher(&self, app: &str) -> Result<()> {
        let watch = BundleWatch {
            provider: FleetProvider {
                session: self.session.clone(),
                cluster: self.cluster.clone(),
                client: self.client.clone(),
                target: self.target.clone(),
                sink: self.sink.clone(),
                cancel: self.cancel.child_token(),
                settings: self.settings.clone(),
            },
            app: app.to_string(),
        };
        tokio::spawn(watch.run());
        Ok(())
    }

    // Fleet reports progress in the bundle itself; there is no separate status object.
    async fn apply_status_cr(&self, _app: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_status_cr(&self, _app: &str) -> Result<()> {
        Ok(())
    }
}

struct BundleWatch {
    provider: FleetProvider,
    app: String,
}

impl BundleWatch {
    async fn run(self) {
        let p = &self.provider;
        info!(session = %p.session, app = %self.app, cluster = %p.cluster, "bundle watcher started");
        loop {
            tokio::select! {
                _ = p.cancel.cancelled() => return,
                _ = tokio::time::sleep(p.settings.status_poll_interval) => {}
            }
            match p.sink.session_exists(&p.session).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(session = %p.session, app = %self.app, "session deleted, stopping bundle watcher");
                    return;
                }
                Err(e) => {
                    warn!(session = %p.session, error = %e, "session lookup failed");
                    continue;
                }
            }
            match p.current_bundle(&self.app).await {
                Ok(Some(bundle)) => {
                    p.sink
                        .observe(&p.session, &self.app, &p.cluster, summary_status(&bundle))
                        .await;
                }
                Ok(None) => debug!(app = %self.app, "bundle not present yet"),
                Err(e) => warn!(cluster = %p.cluster, error = %e, "bundle fetch failed"),
            }
        }
    }
}

/// Builds fleet providers from descriptors holding a management-cluster kubeconfig
pub struct FleetFactory;

async fn write_kubeconfig(dir: &Path, encoded: &str) -> Result<std::path::PathBuf> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::configuration(FLEET_BACKEND, format!("kubeconfig is not base64: {e}")))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::internal_with_context(FLEET_BACKEND, e.to_string()))?;
    let path = dir.join(KUBECONFIG_FILE);
    tokio::fs::write(&path, decoded)
        .await
        .map_err(|e| Error::internal_with_context(FLEET_BACKEND, e.to_string()))?;
    Ok(path)
}

#[async_trait]
impl BackendFactory for FleetFactory {
    async fn build(&self, ctx: BackendContext) -> Result<Arc<dyn ClientProvider>> {
        let descriptor = ctx.descriptor(FLEET_BACKEND)?;
        let kubeconfig = write_kubeconfig(&ctx.work_dir, descriptor.property("kubeconfig")?).await?;
        let target = FleetTarget {
            namespace: descriptor
                .optional("namespace")
                .unwrap_or(DEFAULT_FLEET_NAMESPACE)
                .to_string(),
            cluster_name: descriptor
                .optional("clusterName")
                .unwrap_or(&ctx.cluster.cluster)
                .to_string(),
        };
        let client = create_client(&kubeconfig).await?;
        Ok(Arc::new(FleetProvider::new(ctx, client, target)))
    }
}
