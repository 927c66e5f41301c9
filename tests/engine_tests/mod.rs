//! Integration tests for the rsync engine
//!
//! These tests tell the story of how an orchestrator drives deployment
//! sessions through their lifecycle.
//!
//! # Test Organization
//!
//! - `recorder`: in-memory backend registered in place of the direct
//!   Kubernetes backend; records every staged change and reports committed
//!   objects back as ready
//!
//! - `lifecycle`: stories about install, terminate, update and rollback of
//!   composite apps, including dependency ordering and compensation
//!
//! - `grpc`: stories about the `InstallApp` and `UpdateApp` services as an
//!   orchestrator sees them

mod grpc;
mod lifecycle;
mod recorder;
