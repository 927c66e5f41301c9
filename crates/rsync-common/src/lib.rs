//! Common types for rsync: application model, errors, status schema, and utilities

#![warn(missing_docs)]

pub mod crd;
pub mod discovery;
pub mod error;
pub mod kube_utils;
pub mod labels;
pub mod status;
pub mod telemetry;
pub mod types;
pub mod yaml;

pub use error::Error;
pub use status::ResourceBundleStatus;
pub use types::{
    App, AppResource, Cluster, ClusterName, CompositeApp, Criteria, DeploymentState, OpStatus,
};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Credential level denoting the cluster-wide credential
pub const CLUSTER_LEVEL: &str = "0";
