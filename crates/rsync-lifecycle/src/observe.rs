//! Glue between observed status and the dependency coordinators

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use rsync_common::{ResourceBundleStatus, Result};
use rsync_depend::{CoordinatorRegistry, ReadinessProbe};
use rsync_provider::WatchSink;
use rsync_store::{AppContextStore, StatusStore};

/// Answers coordinator queries from the session and status stores
pub struct SessionProbe {
    sessions: Arc<dyn AppContextStore>,
    status: Arc<StatusStore>,
}

impl SessionProbe {
    /// Probe over the given stores
    pub fn new(sessions: Arc<dyn AppContextStore>, status: Arc<StatusStore>) -> Self {
        Self { sessions, status }
    }
}

#[async_trait]
impl ReadinessProbe for SessionProbe {
    async fn app_clusters(&self, session: &str, app: &str) -> Result<Vec<String>> {
        let record = self.sessions.get(session).await?;
        Ok(record
            .app
            .app(app)
            .map(|a| a.active_clusters().map(|c| c.name.clone()).collect())
            .unwrap_or_default())
    }

    async fn is_app_ready_on(&self, session: &str, app: &str, cluster: &str) -> bool {
        self.status.is_app_ready_on(session, app, cluster)
    }

    async fn is_app_deployed(&self, session: &str, app: &str) -> bool {
        self.status.is_deployed(session, app)
    }

    async fn is_resource_ready(
        &self,
        session: &str,
        app: &str,
        cluster: &str,
        name: &str,
        kind: &str,
    ) -> bool {
        self.status
            .status(session, app, cluster)
            .is_some_and(|s| s.is_resource_ready(name, kind))
    }

    async fn is_resource_succeeded(
        &self,
        session: &str,
        app: &str,
        cluster: &str,
        name: &str,
        kind: &str,
    ) -> bool {
        self.status
            .status(session, app, cluster)
            .is_some_and(|s| s.is_resource_succeeded(name, kind))
    }
}

/// Records what watchers observe and wakes the session's coordinator
pub struct EngineSink {
    sessions: Arc<dyn AppContextStore>,
    status: Arc<StatusStore>,
    coordinators: CoordinatorRegistry,
}

impl EngineSink {
    /// Sink over the given stores and coordinators
    pub fn new(
        sessions: Arc<dyn AppContextStore>,
        status: Arc<StatusStore>,
        coordinators: CoordinatorRegistry,
    ) -> Self {
        Self {
            sessions,
            status,
            coordinators,
        }
    }
}

#[async_trait]
impl WatchSink for EngineSink {
    async fn session_exists(&self, session: &str) -> Result<bool> {
        self.sessions.exists(session).await
    }

    async fn observe(&self, session: &str, app: &str, cluster: &str, status: ResourceBundleStatus) {
        trace!(session = %session, app = %app, cluster = %cluster, ready = status.ready, "status observed");
        self.status.record_status(session, app, cluster, status);
        if let Some(coordinator) = self.coordinators.get(session) {
            coordinator.resources_ready(app, cluster);
        }
    }
}
