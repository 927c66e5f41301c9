//! Status report schema and readiness predicates
//!
//! An in-cluster agent (or the fleet backend) reports what it observes for
//! one `(session, app)` on one cluster as a [`ResourceBundleStatus`]. The
//! dependency coordinator evaluates readiness against these reports.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Observed state of every resource deployed for one app on one cluster
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBundleStatus {
    /// Agent's overall verdict for the bundle
    #[serde(default)]
    pub ready: bool,
    /// Number of resources the agent is tracking
    #[serde(default)]
    pub resource_count: i32,
    /// Observed pods
    #[serde(default)]
    pub pod_statuses: Vec<Pod>,
    /// Observed services
    #[serde(default)]
    pub service_statuses: Vec<Service>,
    /// Observed config maps
    #[serde(default)]
    pub config_map_statuses: Vec<ConfigMap>,
    /// Observed deployments
    #[serde(default)]
    pub deployment_statuses: Vec<Deployment>,
    /// Observed daemon sets
    #[serde(default)]
    pub daemon_set_statuses: Vec<DaemonSet>,
    /// Observed certificate signing requests
    #[serde(default)]
    pub csr_statuses: Vec<CertificateSigningRequest>,
    /// Observed jobs
    #[serde(default)]
    pub job_statuses: Vec<Job>,
    /// Observed stateful sets
    #[serde(default)]
    pub stateful_set_statuses: Vec<StatefulSet>,
    /// Any other kind, as raw bytes
    #[serde(default)]
    pub resource_statuses: Vec<TypedResourceStatus>,
}

/// Generic status entry for kinds without a typed list
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypedResourceStatus {
    /// API group
    #[serde(default)]
    pub group: String,
    /// API version
    #[serde(default)]
    pub version: String,
    /// Kind
    pub kind: String,
    /// Object name
    pub name: String,
    /// Object namespace
    #[serde(default)]
    pub namespace: String,
    /// Base64 encoded raw object
    #[serde(default)]
    pub res: String,
}

fn named(meta: &ObjectMeta, name: &str) -> bool {
    meta.name.as_deref() == Some(name)
}

fn pod_succeeded(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Succeeded")
}

fn pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() == Some("Succeeded") {
        return true;
    }
    status.phase.as_deref() == Some("Running")
        && status
            .conditions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True")
}

fn job_succeeded(job: &Job) -> bool {
    let Some(status) = job.status.as_ref() else {
        return false;
    };
    status.succeeded.unwrap_or(0) > 0
        || status
            .conditions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Complete" && c.status == "True")
}

fn deployment_ready(d: &Deployment) -> bool {
    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    d.status
        .as_ref()
        .is_some_and(|s| s.ready_replicas.unwrap_or(0) >= desired)
}

fn stateful_set_ready(s: &StatefulSet) -> bool {
    let desired = s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    s.status
        .as_ref()
        .is_some_and(|st| st.ready_replicas.unwrap_or(0) >= desired)
}

fn daemon_set_ready(d: &DaemonSet) -> bool {
    d.status
        .as_ref()
        .is_some_and(|s| s.number_ready >= s.desired_number_scheduled)
}

fn csr_approved(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Approved")
}

impl ResourceBundleStatus {
    /// Whether the agent reports the whole bundle ready
    pub fn is_bundle_ready(&self) -> bool {
        self.ready
    }

    /// Continuously-ready semantics for a named resource of `kind`
    pub fn is_resource_ready(&self, name: &str, kind: &str) -> bool {
        match kind {
            "Pod" => self
                .pod_statuses
                .iter()
                .any(|p| named(&p.metadata, name) && pod_ready(p)),
            "Job" => self
                .job_statuses
                .iter()
                .any(|j| named(&j.metadata, name) && job_succeeded(j)),
            "Deployment" => self
                .deployment_statuses
                .iter()
                .any(|d| named(&d.metadata, name) && deployment_ready(d)),
            "StatefulSet" => self
                .stateful_set_statuses
                .iter()
                .any(|s| named(&s.metadata, name) && stateful_set_ready(s)),
            "DaemonSet" => self
                .daemon_set_statuses
                .iter()
                .any(|d| named(&d.metadata, name) && daemon_set_ready(d)),
            "CertificateSigningRequest" => self
                .csr_statuses
                .iter()
                .any(|c| named(&c.metadata, name) && csr_approved(c)),
            "Service" => self
                .service_statuses
                .iter()
                .any(|s| named(&s.metadata, name)),
            "ConfigMap" => self
                .config_map_statuses
                .iter()
                .any(|c| named(&c.metadata, name)),
            _ => self
                .resource_statuses
                .iter()
                .any(|r| r.kind == kind && r.name == name),
        }
    }

    /// Run-to-completion semantics: only pods and jobs can succeed
    pub fn is_resource_succeeded(&self, name: &str, kind: &str) -> bool {
        match kind {
            "Pod" => self
                .pod_statuses
                .iter()
                .any(|p| named(&p.metadata, name) && pod_succeeded(p)),
            "Job" => self
                .job_statuses
                .iter()
                .any(|j| named(&j.metadata, name) && job_succeeded(j)),
            _ => false,
        }
    }
}
