//! Status watcher for clusters reached through the Kubernetes API

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rsync_common::crd::ResourceBundleState;
use rsync_common::labels::deployment_selector;
use rsync_common::Result;

use super::KubeTarget;
use crate::provider::WatchSink;

/// One watched `(session, app)` on one cluster
pub(crate) struct StatusWatch {
    pub session: String,
    pub app: String,
    pub cluster: String,
    pub namespace: String,
    pub sink: Arc<dyn WatchSink>,
    pub cancel: CancellationToken,
    pub session_check_interval: Duration,
}

/// Run the watcher in the background until cancelled or the session is deleted
pub(crate) fn spawn_status_watcher(target: Arc<KubeTarget>, watch: StatusWatch) {
    tokio::spawn(async move {
        let (session, app, cluster) = (watch.session.clone(), watch.app.clone(), watch.cluster.clone());
        if let Err(e) = run_status_watcher(target, watch).await {
            error!(session = %session, app = %app, cluster = %cluster, error = %e, "status watcher failed");
        }
    });
}

async fn run_status_watcher(target: Arc<KubeTarget>, watch: StatusWatch) -> Result<()> {
    let api: Api<ResourceBundleState> = Api::namespaced(target.client().clone(), &watch.namespace);
    let config = watcher::Config::default().labels(&deployment_selector(&watch.session, &watch.app));
    let stream = watcher(api, config).default_backoff().applied_objects();
    tokio::pin!(stream);

    let mut session_check = tokio::time::interval(watch.session_check_interval);
    info!(session = %watch.session, app = %watch.app, cluster = %watch.cluster, "status watcher started");

    loop {
        tokio::select! {
            _ = watch.cancel.cancelled() => {
                debug!(session = %watch.session, app = %watch.app, cluster = %watch.cluster, "status watcher cancelled");
                return Ok(());
            }
            _ = session_check.tick() => {
                match watch.sink.session_exists(&watch.session).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(session = %watch.session, app = %watch.app, "session deleted, stopping status watcher");
                        if let Err(e) = target.delete_status_cr(&watch.session, &watch.app, &watch.namespace).await {
                            warn!(session = %watch.session, app = %watch.app, error = %e, "failed to delete status object");
                        }
                        return Ok(());
                    }
                    Err(e) => warn!(session = %watch.session, error = %e, "session lookup failed"),
                }
            }
            event = stream.next() => match event {
                Some(Ok(obj)) => {
                    if let Some(status) = obj.status {
                        watch
                            .sink
                            .observe(&watch.session, &watch.app, &watch.cluster, status)
                            .await;
                    }
                }
                Some(Err(e)) => warn!(cluster = %watch.cluster, error = %e, "status watch error"),
                None => return Ok(()),
            }
        }
    }
}
