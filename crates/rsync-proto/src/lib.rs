//! Protocol buffer definitions for the rsync deployment APIs.
//!
//! Two services are exposed by the rsync daemon:
//!
//! - `InstallApp`: [`InstallAppRequest`] instantiates every app of a session,
//!   [`UninstallAppRequest`] tears it down.
//! - `UpdateApp`: [`UpdateAppRequest`] moves a deployment from one session to
//!   a newer one, [`RollbackAppRequest`] moves it back to an earlier one.
//!
//! Every response carries a success flag and, on failure, a message naming
//! the step that failed.

#![allow(missing_docs)]

/// Generated protobuf types
pub mod rsync {
    pub mod v1 {
        tonic::include_proto!("rsync.v1");
    }
}

pub use rsync::v1::*;

pub use install_app_client::InstallAppClient;
pub use install_app_server::{InstallApp, InstallAppServer};
pub use update_app_client::UpdateAppClient;
pub use update_app_server::{UpdateApp, UpdateAppServer};
