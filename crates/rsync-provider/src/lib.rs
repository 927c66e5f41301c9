//! Deployment backends for rsync
//!
//! A [`ClientProvider`] turns staged resource operations into effects on
//! one cluster. Backends are built through the [`BackendRegistry`] from the
//! credentials resolved for a cluster:
//!
//! | type         | effect                                                 |
//! |--------------|--------------------------------------------------------|
//! | `k8s`        | applies each resource immediately through the API      |
//! | `k8s-batch`  | collects a multi-document file, applies it on commit   |
//! | `github`     | commits desired state for Flux to sync                 |
//! | `azureArcV2` | commits desired state, configures Flux through ARM     |
//! | `fleet`      | writes one Fleet bundle per session and app            |

#![warn(missing_docs)]

pub mod fleet;
pub mod gitops;
pub mod k8s;
pub mod provider;
pub mod registry;

pub use provider::{
    Accumulator, BackendContext, ClientProvider, CommitReport, Credentials, IdentityScope,
    OpKind, ProviderSettings, ResourceFailure, StagedResource, WatchSink,
};
pub use registry::{BackendFactory, BackendRegistry};

pub use rsync_common::{Error, Result};
