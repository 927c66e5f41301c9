//! Composite application model
//!
//! The declarative graph handed to the engine for one deployment session.
//! It is produced and validated elsewhere; the engine only walks it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Separator used in every composite key (`provider+cluster`, `app+cluster`, `name+kind`)
pub const KEY_SEPARATOR: char = '+';

/// A composite application: named sub-applications with an ordering
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompositeApp {
    /// Composite application name
    pub name: String,
    /// Opaque metadata carried through from the caller
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Base application sequence
    #[serde(default)]
    pub app_order: Vec<String>,
    /// Applications by name
    #[serde(default)]
    pub apps: BTreeMap<String, App>,
}

impl CompositeApp {
    /// Apps in `app_order` that exist and are not skipped
    pub fn ordered_apps(&self) -> impl Iterator<Item = &App> {
        self.app_order
            .iter()
            .filter_map(|name| self.apps.get(name))
            .filter(|app| !app.skip)
    }

    /// Look up an app by name
    pub fn app(&self, name: &str) -> Option<&App> {
        self.apps.get(name)
    }
}

/// One sub-application targeted at one or more clusters
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct App {
    /// App name
    pub name: String,
    /// Target clusters keyed by `provider+cluster`
    #[serde(default)]
    pub clusters: BTreeMap<String, Cluster>,
    /// Dependencies on other apps: label → condition to wait for
    #[serde(default)]
    pub dependency: BTreeMap<String, Criteria>,
    /// Skip this app entirely
    #[serde(default)]
    pub skip: bool,
}

impl App {
    /// Clusters that are not skipped
    pub fn active_clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values().filter(|c| !c.skip)
    }
}

/// One target cluster of an app and the resources placed on it
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Cluster name (`provider+cluster`)
    pub name: String,
    /// Authoritative application sequence of resources
    #[serde(default)]
    pub res_order: Vec<String>,
    /// Resources by name (`name+kind`)
    #[serde(default)]
    pub resources: BTreeMap<String, AppResource>,
    /// Intra-cluster ordering edges: resource → resources it waits for
    #[serde(default)]
    pub dependency: BTreeMap<String, Vec<String>>,
    /// Skip this cluster
    #[serde(default)]
    pub skip: bool,
}

impl Cluster {
    /// Resources in `res_order` that exist and are not skipped
    pub fn ordered_resources(&self) -> impl Iterator<Item = &AppResource> {
        self.res_order
            .iter()
            .filter_map(|name| self.resources.get(name))
            .filter(|r| !r.skip)
    }
}

/// A single resource manifest
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppResource {
    /// Resource name (`name+kind`)
    pub name: String,
    /// Opaque manifest (YAML or JSON)
    pub data: String,
    /// Approval payload for certificate-signing-request-like resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<serde_json::Value>,
    /// Skip this resource
    #[serde(default)]
    pub skip: bool,
}

/// Status an app dependency waits for
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OpStatus {
    /// Resources of the app are running and ready on every target cluster
    Ready,
    /// Resources of the app have been committed to every target cluster
    Deployed,
    /// Anything else is carried through but ignored by the coordinator
    #[serde(other)]
    Unknown,
}

/// Condition a dependency waiter blocks on
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Criteria {
    /// Status to wait for
    pub op_status: OpStatus,
    /// Grace delay applied after the condition is observed
    #[serde(default)]
    pub wait_seconds: u64,
}

impl Criteria {
    /// Wait for Ready with the given grace delay
    pub fn ready(wait_seconds: u64) -> Self {
        Self {
            op_status: OpStatus::Ready,
            wait_seconds,
        }
    }

    /// Wait for Deployed with the given grace delay
    pub fn deployed(wait_seconds: u64) -> Self {
        Self {
            op_status: OpStatus::Deployed,
            wait_seconds,
        }
    }
}

/// Lifecycle states of a deployment session
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeploymentState {
    /// Session exists, nothing deployed
    #[default]
    Created,
    /// Instantiation in progress
    Instantiating,
    /// Instantiation finished
    Instantiated,
    /// Instantiation failed
    InstantiateFailed,
    /// Update in progress
    Updating,
    /// Update finished
    Updated,
    /// Update failed
    UpdateFailed,
    /// Teardown in progress
    Terminating,
    /// Teardown finished
    Terminated,
    /// Teardown failed
    TerminateFailed,
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A `provider+cluster` pair
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterName {
    /// Cluster provider
    pub provider: String,
    /// Cluster name within the provider
    pub cluster: String,
}

impl ClusterName {
    /// Build from parts
    pub fn new(provider: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            cluster: cluster.into(),
        }
    }
}

impl FromStr for ClusterName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(KEY_SEPARATOR) {
            Some((provider, cluster))
                if !provider.is_empty()
                    && !cluster.is_empty()
                    && !cluster.contains(KEY_SEPARATOR) =>
            {
                Ok(Self::new(provider, cluster))
            }
            _ => Err(Error::invalid_cluster_name(s)),
        }
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.provider, KEY_SEPARATOR, self.cluster)
    }
}

/// Dependency bookkeeping key for an app on one cluster
pub fn app_cluster_key(app: &str, cluster: &str) -> String {
    format!("{app}{KEY_SEPARATOR}{cluster}")
}

/// Split a resource name into `(name, kind)`.
///
/// Names without a kind suffix return an empty kind.
pub fn split_resource_name(resource: &str) -> (&str, &str) {
    resource
        .rsplit_once(KEY_SEPARATOR)
        .unwrap_or((resource, ""))
}

/// Join a resource name and kind into the resource identity used in `res_order`
pub fn resource_name(name: &str, kind: &str) -> String {
    format!("{name}{KEY_SEPARATOR}{kind}")
}
