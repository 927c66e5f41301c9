//! Cluster connections for rsync
//!
//! Resolves `provider+cluster` names to backend providers, one cache per
//! deployment session.

#![warn(missing_docs)]

pub mod cache;

pub use cache::{ConnectionCache, Connector, ConnectorSettings};
pub use rsync_common::{Error, Result};
