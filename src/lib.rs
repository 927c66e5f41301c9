//! rsync - resource synchronization engine
//!
//! Deploys composite applications across clusters through pluggable
//! backends. The daemon exposes the deployment engine over gRPC; the work
//! itself lives in the `rsync-*` crates.

#![warn(missing_docs)]

pub mod server;

pub use rsync_lifecycle::{Engine, EngineSettings};
