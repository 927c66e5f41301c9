//! Kubernetes helpers shared by the direct backends and the status watcher

use std::path::Path;
use std::time::Duration;

use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiResource, Discovery};
use kube::{Client, Config};
use serde_json::Value;
use tracing::trace;

use crate::{Error, Result};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "rsync";

/// Connect timeout for per-cluster clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for per-cluster clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A parsed manifest with the identity needed to address it on a cluster
#[derive(Debug, Clone)]
pub struct ManifestMetadata {
    /// The parsed document
    pub value: Value,
    /// Object kind
    pub kind: String,
    /// Object name
    pub name: String,
    /// Namespace, if namespaced
    pub namespace: Option<String>,
    /// Resource type derived from apiVersion/kind
    pub api_resource: ApiResource,
}

impl ManifestMetadata {
    /// `kind/name` for log and error messages
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

fn required_str<'a>(value: &'a Value, pointer: &str) -> Result<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::serialization(format!("manifest missing {}", &pointer[1..])))
}

/// Parse a YAML or JSON manifest and extract its identity
pub fn parse_manifest(manifest: &str) -> Result<ManifestMetadata> {
    let value = crate::yaml::parse_document(manifest)?;
    manifest_metadata(value)
}

/// Extract identity from an already parsed manifest
pub fn manifest_metadata(value: Value) -> Result<ManifestMetadata> {
    let api_version = required_str(&value, "/apiVersion")?.to_string();
    let kind = required_str(&value, "/kind")?.to_string();
    let name = required_str(&value, "/metadata/name")?.to_string();
    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .map(str::to_string);
    let api_resource = build_api_resource(&api_version, &kind);
    Ok(ManifestMetadata {
        value,
        kind,
        name,
        namespace,
        api_resource,
    })
}

/// Split apiVersion into `(group, version)`; the core group is empty
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from an explicit apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("ingress", "ingresses"),
    ("networkpolicy", "networkpolicies"),
    ("podsecuritypolicy", "podsecuritypolicies"),
    ("storageclass", "storageclasses"),
    ("priorityclass", "priorityclasses"),
    ("ingressclass", "ingressclasses"),
];

/// Lower-case plural used in resource URLs
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{lower}es")
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

/// Resolve a manifest's resource type through discovery.
///
/// Falls back to the type derived from the manifest when discovery does not
/// know it, so freshly installed CRDs can still be addressed.
pub fn resolve_api_resource(discovery: Option<&Discovery>, meta: &ManifestMetadata) -> ApiResource {
    let gvk = GroupVersionKind {
        group: meta.api_resource.group.clone(),
        version: meta.api_resource.version.clone(),
        kind: meta.kind.clone(),
    };
    match discovery.and_then(|d| d.resolve_gvk(&gvk)) {
        Some((ar, _)) => ar,
        None => {
            trace!(kind = %meta.kind, "resource type not discovered, using manifest apiVersion");
            meta.api_resource.clone()
        }
    }
}

/// Dynamic API handle scoped to the manifest's namespace (or cluster-wide)
pub fn dynamic_api(client: &Client, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, ar),
        None => Api::all_with(client.clone(), ar),
    }
}

/// Create a client from a kubeconfig file with the default timeouts
pub async fn create_client(kubeconfig: &Path) -> Result<Client> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a client from a kubeconfig file with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: &Path,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::configuration("kubeconfig", format!("failed to read kubeconfig: {e}"))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::configuration("kubeconfig", format!("failed to load kubeconfig: {e}"))
        })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {e}"))
    })
}
