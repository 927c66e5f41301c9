//! ResourceBundleState custom resource
//!
//! One object per `(session, app)` on each target cluster. The in-cluster
//! agent watches objects of this kind and writes a [`ResourceBundleStatus`]
//! for every resource matching the selector.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::labels::{deployment_label_value, DEPLOYMENT_LABEL};
use crate::status::ResourceBundleStatus;
use crate::{Error, Result};

/// Namespace the status object is created in unless the caller chooses one
pub const DEFAULT_STATUS_NAMESPACE: &str = "default";

/// Spec of a ResourceBundleState: which resources the agent reports on
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "k8splugin.io",
    version = "v1alpha1",
    kind = "ResourceBundleState",
    namespaced,
    status = "ResourceBundleStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBundleStateSpec {
    /// Resources carrying these labels are reported
    pub selector: LabelSelector,
}

/// Name of the status object for one app of a session
pub fn status_cr_name(session: &str, app: &str) -> String {
    deployment_label_value(session, app)
}

/// Build the status object selecting every resource tagged for `(session, app)`
pub fn build_status_cr(session: &str, app: &str, namespace: &str) -> ResourceBundleState {
    let value = deployment_label_value(session, app);
    let labels = BTreeMap::from([(DEPLOYMENT_LABEL.to_string(), value.clone())]);
    ResourceBundleState {
        metadata: ObjectMeta {
            name: Some(status_cr_name(session, app)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: ResourceBundleStateSpec {
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
        },
        status: None,
    }
}

/// Render the status object as a YAML manifest
pub fn status_cr_manifest(session: &str, app: &str, namespace: &str) -> Result<String> {
    serde_yaml::to_string(&build_status_cr(session, app, namespace))
        .map_err(|e| Error::serialization_for_kind("ResourceBundleState", e.to_string()))
}
