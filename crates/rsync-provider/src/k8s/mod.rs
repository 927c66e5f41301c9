//! Kubernetes API backends
//!
//! Both variants talk to the cluster through [`KubeTarget`]: the direct
//! backend applies every staged resource immediately, the batch backend
//! collects a multi-document file and applies it on commit.

mod batch;
mod direct;
mod watch;

pub use batch::BatchProvider;
pub use direct::DirectProvider;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestStatus};
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::Discovery;
use kube::Client;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

use rsync_common::crd::{build_status_cr, status_cr_name, ResourceBundleState};
use rsync_common::kube_utils::{
    create_client, dynamic_api, parse_manifest, resolve_api_resource,
    ManifestMetadata, FIELD_MANAGER,
};
use rsync_common::{Error, Result};

use crate::provider::{BackendContext, ClientProvider};
use crate::registry::BackendFactory;

/// Backend type of the direct variant
pub const DIRECT_BACKEND: &str = "k8s";
/// Backend type of the batched-file variant
pub const BATCH_BACKEND: &str = "k8s-batch";

/// Kind that may carry an approval payload
const CSR_KIND: &str = "CertificateSigningRequest";

/// Client for one cluster with lazily run API discovery
pub struct KubeTarget {
    client: Client,
    discovery: OnceCell<Option<Arc<Discovery>>>,
}

impl KubeTarget {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: OnceCell::new(),
        }
    }

    /// Underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn discovery(&self) -> Option<Arc<Discovery>> {
        self.discovery
            .get_or_init(|| async {
                match Discovery::new(self.client.clone()).run().await {
                    Ok(d) => Some(Arc::new(d)),
                    Err(e) => {
                        warn!(error = %e, "API discovery failed, using manifest apiVersion");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn api_for(&self, meta: &ManifestMetadata) -> Api<DynamicObject> {
        let discovery = self.discovery().await;
        let ar = resolve_api_resource(discovery.as_deref(), meta);
        dynamic_api(&self.client, &ar, meta.namespace.as_deref())
    }

    /// Server-side apply a manifest; the applied payload wins
    pub async fn apply_manifest(&self, manifest: &str) -> Result<ManifestMetadata> {
        let meta = parse_manifest(manifest)?;
        let api = self.api_for(&meta).await;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&meta.name, &params, &Patch::Apply(&meta.value))
            .await?;
        trace!(resource = %meta.display_name(), "applied");
        Ok(meta)
    }

    /// Create a manifest; an existing object counts as success
    pub async fn create_manifest(&self, manifest: &str) -> Result<ManifestMetadata> {
        let meta = parse_manifest(manifest)?;
        let api = self.api_for(&meta).await;
        let obj: DynamicObject = serde_json::from_value(meta.value.clone())
            .map_err(|e| Error::serialization_for_kind(&meta.kind, e.to_string()))?;
        match api.create(&PostParams::default(), &obj).await {
            Ok(_) => trace!(resource = %meta.display_name(), "created"),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(resource = %meta.display_name(), "already exists");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(meta)
    }

    /// Delete a manifest's object; a missing object counts as success
    pub async fn delete_manifest(&self, manifest: &str) -> Result<ManifestMetadata> {
        let meta = parse_manifest(manifest)?;
        let api = self.api_for(&meta).await;
        match api.delete(&meta.name, &DeleteParams::background()).await {
            Ok(_) => trace!(resource = %meta.display_name(), "deleted"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(resource = %meta.display_name(), "already gone");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(meta)
    }

    /// Current object for a manifest, if it exists
    pub async fn get_manifest(&self, manifest: &str) -> Result<Option<Value>> {
        let meta = parse_manifest(manifest)?;
        let api = self.api_for(&meta).await;
        match api.get_opt(&meta.name).await? {
            Some(obj) => serde_json::to_value(obj)
                .map(Some)
                .map_err(|e| Error::serialization_for_kind(&meta.kind, e.to_string())),
            None => Ok(None),
        }
    }

    /// Write an approval payload into a certificate signing request.
    ///
    /// Other kinds ignore the payload.
    pub async fn approve(&self, manifest: &str, approval: &Value) -> Result<()> {
        let meta = parse_manifest(manifest)?;
        if meta.kind != CSR_KIND {
            return Ok(());
        }
        let status: CertificateSigningRequestStatus = serde_json::from_value(approval.clone())
            .map_err(|e| Error::serialization_for_kind(CSR_KIND, e.to_string()))?;
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let mut csr = api.get(&meta.name).await?;
        csr.status = Some(status);
        let body =
            serde_json::to_vec(&csr).map_err(|e| Error::serialization_for_kind(CSR_KIND, e.to_string()))?;
        api.replace_subresource("approval", &meta.name, &PostParams::default(), body)
            .await?;
        debug!(csr = %meta.name, "approval written");
        Ok(())
    }

    /// Probe the API server
    pub async fn probe(&self) -> Result<()> {
        self.client.apiserver_version().await?;
        Ok(())
    }

    /// Install the status object for one app
    pub async fn apply_status_cr(&self, session: &str, app: &str, namespace: &str) -> Result<()> {
        let cr = build_status_cr(session, app, namespace);
        let api: Api<ResourceBundleState> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&status_cr_name(session, app), &params, &Patch::Apply(&cr))
            .await?;
        Ok(())
    }

    /// Remove the status object for one app
    pub async fn delete_status_cr(&self, session: &str, app: &str, namespace: &str) -> Result<()> {
        let api: Api<ResourceBundleState> = Api::namespaced(self.client.clone(), namespace);
        match api
            .delete(&status_cr_name(session, app), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Builds direct or batched Kubernetes providers from materialized kubeconfigs
pub struct KubeFactory {
    batch: bool,
}

impl KubeFactory {
    /// Immediate per-resource apply
    pub fn direct() -> Self {
        Self { batch: false }
    }

    /// Multi-document file applied on commit
    pub fn batched() -> Self {
        Self { batch: true }
    }
}

#[async_trait]
impl BackendFactory for KubeFactory {
    async fn build(&self, ctx: BackendContext) -> Result<Arc<dyn ClientProvider>> {
        let backend = if self.batch { BATCH_BACKEND } else { DIRECT_BACKEND };
        let client = create_client(ctx.kubeconfig(backend)?).await?;
        let target = Arc::new(KubeTarget::new(client));
        Ok(if self.batch {
            Arc::new(BatchProvider::new(ctx, target))
        } else {
            Arc::new(DirectProvider::new(ctx, target))
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::Mutex;

    use http::{Method, Request, Response};
    use kube::client::Body;
    use serde_json::json;

    /// In-process API server answering by method and path suffix.
    ///
    /// Unmatched calls get 404, so API discovery fails and resource types
    /// come from the manifest's apiVersion.
    #[derive(Clone, Default)]
    pub(crate) struct FakeApiServer {
        routes: Arc<Vec<(Method, String, u16)>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeApiServer {
        pub(crate) fn new(routes: &[(Method, &str, u16)]) -> Self {
            Self {
                routes: Arc::new(
                    routes
                        .iter()
                        .map(|(m, p, code)| (m.clone(), p.to_string(), *code))
                        .collect(),
                ),
                calls: Arc::default(),
            }
        }

        /// Resource calls seen so far, as `METHOD path`
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn target(&self) -> Arc<KubeTarget> {
            let server = self.clone();
            let service = tower::service_fn(move |req: Request<Body>| {
                let server = server.clone();
                async move { Ok::<_, Infallible>(server.answer(&req)) }
            });
            Arc::new(KubeTarget::new(Client::new(service, "default")))
        }

        fn answer(&self, req: &Request<Body>) -> Response<Body> {
            let path = req.uri().path();
            let code = self
                .routes
                .iter()
                .find(|(method, suffix, _)| method == req.method() && path.ends_with(suffix.as_str()))
                .map_or(404, |(_, _, code)| *code);
            if path != "/api" && path != "/apis" {
                self.calls
                    .lock()
                    .unwrap()
                    .push(format!("{} {path}", req.method()));
            }

            let body = match (code, req.method()) {
                (200..=299, &Method::DELETE) => {
                    json!({ "kind": "Status", "apiVersion": "v1", "metadata": {}, "status": "Success" })
                }
                (200..=299, _) => json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": path.rsplit('/').next().unwrap_or_default(), "namespace": "default" },
                }),
                _ => json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "metadata": {},
                    "status": "Failure",
                    "message": format!("answered {code}"),
                    "reason": "Fake",
                    "code": code,
                }),
            };
            Response::builder()
                .status(code)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string().into_bytes()))
                .unwrap()
        }
    }

    /// Context of a Kubernetes provider for session `s1` on `aws+edge`
    pub(crate) fn kube_context(dir: &std::path::Path) -> BackendContext {
        BackendContext {
            session: "s1".to_string(),
            cluster: rsync_common::ClusterName::new("aws", "edge"),
            level: "0".to_string(),
            namespace: "default".to_string(),
            credentials: crate::provider::Credentials::Kubeconfig(dir.join("config")),
            work_dir: dir.join("work"),
            sink: Arc::new(crate::provider::MockWatchSink::new()),
            cancel: tokio_util::sync::CancellationToken::new(),
            settings: crate::provider::ProviderSettings::default(),
        }
    }

    /// A ConfigMap manifest named `name`
    pub(crate) fn config_map(name: &str) -> String {
        format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: default\n")
    }

    pub(crate) const CONFIG: &str =
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n  namespace: default\ndata:\n  a: b\n";

    #[tokio::test]
    async fn create_of_an_existing_object_succeeds() {
        let server = FakeApiServer::new(&[(Method::POST, "/namespaces/default/configmaps", 409)]);
        let target = server.target();

        let meta = target.create_manifest(CONFIG).await.unwrap();
        assert_eq!(meta.name, "cfg");
        assert_eq!(
            server.calls(),
            vec!["POST /api/v1/namespaces/default/configmaps"]
        );
    }

    #[tokio::test]
    async fn delete_of_a_missing_object_succeeds() {
        let server = FakeApiServer::new(&[]);
        server.target().delete_manifest(CONFIG).await.unwrap();
        assert_eq!(
            server.calls(),
            vec!["DELETE /api/v1/namespaces/default/configmaps/cfg"]
        );
    }

    #[tokio::test]
    async fn other_api_errors_are_not_swallowed() {
        let server = FakeApiServer::new(&[
            (Method::POST, "/configmaps", 422),
            (Method::DELETE, "/configmaps/cfg", 403),
        ]);
        let target = server.target();
        assert!(target.create_manifest(CONFIG).await.is_err());
        assert!(target.delete_manifest(CONFIG).await.is_err());
    }

    #[tokio::test]
    async fn missing_status_object_is_already_deleted() {
        let server = FakeApiServer::new(&[]);
        server
            .target()
            .delete_status_cr("s1", "web", "default")
            .await
            .unwrap();
    }
}
