//! Status-file watcher for git-ops backends
//!
//! The in-cluster agent writes its status report for one `(session, app)`
//! back into the repository. The watcher polls that file and forwards each
//! decoded report to the watch sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rsync_common::yaml::parse_document;
use rsync_common::{Error, ResourceBundleStatus, Result};

use super::git::GitRepo;
use crate::provider::WatchSink;

const STATUS_KIND: &str = "ResourceBundleState";

/// Where a watcher reads status files from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusFileSource: Send + Sync {
    /// Current content of `path`, `None` while it does not exist
    async fn fetch_status(&self, path: &str) -> Result<Option<String>>;
}

#[async_trait]
impl StatusFileSource for GitRepo {
    async fn fetch_status(&self, path: &str) -> Result<Option<String>> {
        self.read_file(path).await
    }
}

/// One polled status file
pub struct StatusFileWatch {
    /// Owning session
    pub session: String,
    /// App the status describes
    pub app: String,
    /// Cluster the status comes from
    pub cluster: String,
    /// Repository path of the status file
    pub path: String,
    /// Delay between polls
    pub interval: Duration,
    /// Destination of decoded reports
    pub sink: Arc<dyn WatchSink>,
    /// Stops the loop when cancelled
    pub cancel: CancellationToken,
}

/// Why a watch loop ended without error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchExit {
    /// The cancellation token fired
    Cancelled,
    /// The owning session no longer exists
    SessionGone,
}

/// Poll the status file until cancelled or the session is deleted.
///
/// Missing files and fetch errors are logged and retried on the next tick.
/// A file that cannot be decoded ends the loop with the decode error.
pub async fn watch_status_file(
    source: &dyn StatusFileSource,
    watch: &StatusFileWatch,
) -> Result<WatchExit> {
    info!(session = %watch.session, app = %watch.app, cluster = %watch.cluster, path = %watch.path, "status file watcher started");
    loop {
        tokio::select! {
            _ = watch.cancel.cancelled() => return Ok(WatchExit::Cancelled),
            _ = tokio::time::sleep(watch.interval) => {}
        }

        match watch.sink.session_exists(&watch.session).await {
            Ok(true) => {}
            Ok(false) => return Ok(WatchExit::SessionGone),
            Err(e) => {
                warn!(session = %watch.session, error = %e, "session lookup failed");
                continue;
            }
        }

        match source.fetch_status(&watch.path).await {
            Ok(Some(text)) => {
                let status = decode_status(&text)?;
                watch
                    .sink
                    .observe(&watch.session, &watch.app, &watch.cluster, status)
                    .await;
            }
            Ok(None) => debug!(path = %watch.path, "status file not present yet"),
            Err(e) => warn!(cluster = %watch.cluster, path = %watch.path, error = %e, "status fetch failed"),
        }
    }
}

/// Decode a status file written as YAML or JSON.
///
/// Accepts a whole status object (the report under `status`) or the bare report.
pub fn decode_status(text: &str) -> Result<ResourceBundleStatus> {
    let mut doc = parse_document(text)?;
    let report = match doc.get_mut("status") {
        Some(status @ Value::Object(_)) => status.take(),
        _ => doc,
    };
    serde_json::from_value(report).map_err(|e| Error::serialization_for_kind(STATUS_KIND, e.to_string()))
}
