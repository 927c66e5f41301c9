//! Deployment engine
//!
//! Drives instantiate, terminate, update and rollback of deployment
//! sessions through the state machine, the connection cache and the
//! dependency coordinators.
//!
//! Apps of a session run concurrently; each one blocks on its declared
//! dependencies before it touches any cluster. The first app to fail cancels
//! the others' waits so nothing hangs on an app that will never deploy.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use rsync_common::{
    App, Cluster, DeploymentState, Error, ResourceBundleStatus, Result, CLUSTER_LEVEL,
};
use rsync_connector::{ConnectionCache, Connector, ConnectorSettings};
use rsync_depend::{CoordinatorRegistry, DependencyCoordinator, DependencySettings};
use rsync_provider::{
    BackendRegistry, ClientProvider, CommitReport, IdentityScope, OpKind, StagedResource,
};
use rsync_store::{
    AppContextStore, CredentialStore, KvContextStore, KvStore, ResourceOutcome, SessionRecord,
    StatusStore,
};

use crate::observe::{EngineSink, SessionProbe};
use crate::plan::{plan_waves, validate_app_dependencies};
use crate::state::{Event, StateMachine};

/// Engine configuration
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Connection cache settings
    pub connector: ConnectorSettings,
    /// Resource dependency poll cadence
    pub dependency: DependencySettings,
    /// Credential level used to reach clusters
    pub credential_level: String,
    /// Credential namespace used to reach clusters
    pub credential_namespace: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connector: ConnectorSettings::default(),
            dependency: DependencySettings::default(),
            credential_level: CLUSTER_LEVEL.to_string(),
            credential_namespace: "default".to_string(),
        }
    }
}

impl EngineSettings {
    /// Settings rooted at `work_dir`, everything else default
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            connector: ConnectorSettings {
                work_dir: work_dir.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Observed state of one app on one cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Latest report says the app is ready
    pub ready: bool,
    /// Outcome of the last operation on each resource
    pub resources: BTreeMap<String, ResourceOutcome>,
    /// Latest report, if any arrived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<ResourceBundleStatus>,
}

/// State of one app of a session
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    /// Committed to every target cluster
    pub deployed: bool,
    /// Per-cluster status
    pub clusters: BTreeMap<String, ClusterStatus>,
}

/// Answer to the Read event
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Session id
    pub id: String,
    /// Lifecycle state
    pub state: DeploymentState,
    /// Per-app status
    pub apps: BTreeMap<String, AppStatus>,
}

/// Deploys and tears down sessions
pub struct Engine {
    sessions: Arc<dyn AppContextStore>,
    credentials: CredentialStore,
    status: Arc<StatusStore>,
    machine: StateMachine,
    connector: Connector,
    coordinators: CoordinatorRegistry,
    settings: EngineSettings,
    watched: Mutex<HashSet<(String, String, String)>>,
}

impl Engine {
    /// Engine persisting through `store` and building backends from `registry`
    pub fn new(store: Arc<dyn KvStore>, registry: BackendRegistry, settings: EngineSettings) -> Self {
        let sessions: Arc<dyn AppContextStore> = Arc::new(KvContextStore::new(store.clone()));
        let credentials = CredentialStore::new(store);
        let status = Arc::new(StatusStore::new());
        let probe = Arc::new(SessionProbe::new(sessions.clone(), status.clone()));
        let coordinators = CoordinatorRegistry::new(probe, settings.dependency.clone());
        let sink = Arc::new(EngineSink::new(
            sessions.clone(),
            status.clone(),
            coordinators.clone(),
        ));
        let connector = Connector::new(
            credentials.clone(),
            Arc::new(registry),
            sink,
            settings.connector.clone(),
        );
        Self {
            machine: StateMachine::new(sessions.clone()),
            sessions,
            credentials,
            status,
            connector,
            coordinators,
            settings,
            watched: Mutex::new(HashSet::new()),
        }
    }

    /// Session records
    pub fn sessions(&self) -> &Arc<dyn AppContextStore> {
        &self.sessions
    }

    /// Cluster credentials
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Observed status
    pub fn status(&self) -> &Arc<StatusStore> {
        &self.status
    }

    /// Dependency coordinators of live sessions
    pub fn coordinators(&self) -> &CoordinatorRegistry {
        &self.coordinators
    }

    /// Instantiate a session, terminating it again if that fails.
    ///
    /// Compensation only touches clusters the instantiation reached. A failed
    /// cleanup is logged; the instantiation error is returned.
    #[instrument(skip(self))]
    pub async fn install(&self, id: &str) -> Result<()> {
        // Nothing to compensate when instantiation cannot start
        let record = self.sessions.get(id).await?;
        Event::Instantiate.check(record.state)?;
        validate_app_dependencies(&record.app)?;

        let Err(err) = self.instantiate(id).await else {
            return Ok(());
        };
        error!(session = %id, error = %err, "instantiation failed, terminating");
        if let Err(cleanup) = self.terminate_session(id, true).await {
            warn!(session = %id, error = %cleanup, "compensating terminate failed");
        }
        Err(err)
    }

    /// Deploy every app of a session
    #[instrument(skip(self))]
    pub async fn instantiate(&self, id: &str) -> Result<()> {
        let record = self.machine.begin(id, Event::Instantiate).await?;
        let op = if record.state == DeploymentState::Created {
            OpKind::Create
        } else {
            OpKind::Apply
        };
        let result = self.deploy_session(&record, op).await;
        self.machine
            .finish(id, Event::Instantiate, result.is_ok())
            .await?;
        if result.is_ok() {
            info!(session = %id, "session instantiated");
        }
        result
    }

    /// Remove everything a session deployed
    #[instrument(skip(self))]
    pub async fn terminate(&self, id: &str) -> Result<()> {
        self.terminate_session(id, false).await
    }

    async fn terminate_session(&self, id: &str, reached_only: bool) -> Result<()> {
        let record = self.machine.begin(id, Event::Terminate).await?;
        let result = self.remove_session(&record, None, reached_only).await;
        self.machine
            .finish(id, Event::Terminate, result.is_ok())
            .await?;
        self.release(id).await;
        if result.is_ok() {
            info!(session = %id, "session terminated");
        }
        result
    }

    /// Replace the deployment of session `from` with session `to`
    #[instrument(skip(self))]
    pub async fn update(&self, from: &str, to: &str) -> Result<()> {
        self.replace(from, to, "update").await
    }

    /// Move the deployment of session `from` back to the earlier session `to`
    #[instrument(skip(self))]
    pub async fn rollback(&self, from: &str, to: &str) -> Result<()> {
        self.replace(from, to, "rollback").await
    }

    async fn replace(&self, from: &str, to: &str, action: &str) -> Result<()> {
        let old = self.sessions.get(from).await?;
        Event::UpdateDelete.check(old.state)?;
        let new = self.machine.begin(to, Event::Update).await?;

        let deployed = self.deploy_session(&new, OpKind::Apply).await;
        if let Err(e) = deployed {
            self.machine.finish(to, Event::Update, false).await?;
            return Err(e);
        }

        self.machine.begin(from, Event::UpdateDelete).await?;
        let removed = self.remove_session(&old, Some(&new), false).await;
        self.machine
            .finish(from, Event::UpdateDelete, removed.is_ok())
            .await?;
        self.release(from).await;
        self.machine
            .finish(to, Event::Update, removed.is_ok())
            .await?;
        if removed.is_ok() {
            info!(from = %from, to = %to, action = %action, "deployment replaced");
        }
        removed
    }

    /// Lifecycle state and observed status of a session
    pub async fn read(&self, id: &str) -> Result<SessionStatus> {
        let record = self.machine.begin(id, Event::Read).await?;
        let mut apps = BTreeMap::new();
        for app in record.app.ordered_apps() {
            let clusters = app
                .active_clusters()
                .map(|cluster| {
                    let observed = self.status.status(id, &app.name, &cluster.name);
                    let status = ClusterStatus {
                        ready: observed.as_ref().is_some_and(|s| s.is_bundle_ready()),
                        resources: self.status.outcomes(id, &app.name, &cluster.name),
                        observed,
                    };
                    (cluster.name.clone(), status)
                })
                .collect();
            apps.insert(
                app.name.clone(),
                AppStatus {
                    deployed: self.status.is_deployed(id, &app.name),
                    clusters,
                },
            );
        }
        Ok(SessionStatus {
            id: record.id,
            state: record.state,
            apps,
        })
    }

    /// Delete a session record and everything kept for it in memory.
    ///
    /// Watchers notice the deletion on their next poll and clean up their
    /// status objects.
    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        let deleted = self.sessions.delete(id).await?;
        self.coordinators.dispose(id);
        self.status.clear_session(id);
        Ok(deleted)
    }

    async fn release(&self, id: &str) {
        self.coordinators.dispose(id);
        self.connector.release(id).await;
        self.status.clear_observed(id);
        self.watched.lock().retain(|(session, _, _)| session != id);
    }

    async fn deploy_session(&self, record: &SessionRecord, op: OpKind) -> Result<()> {
        validate_app_dependencies(&record.app)?;
        let coordinator = self.coordinators.get_or_create(&record.id);
        let cache = self.connector.cache(&record.id).await;
        let cancel = cache.cancellation().child_token();

        let apps: Vec<&App> = record.app.ordered_apps().collect();
        for app in &apps {
            coordinator.add_dependency(&app.name, &app.dependency);
        }

        let runs = apps.iter().map(|app| {
            let (coordinator, cache, cancel) = (&coordinator, &cache, &cancel);
            async move {
                let result = self
                    .deploy_app(&record.id, app, op, coordinator, cache, cancel)
                    .await;
                if let Err(e) = &result {
                    error!(session = %record.id, app = %app.name, error = %e, "app deployment failed");
                    cancel.cancel();
                }
                result
            }
        });
        first_error(join_all(runs).await)
    }

    async fn deploy_app(
        &self,
        session: &str,
        app: &App,
        op: OpKind,
        coordinator: &DependencyCoordinator,
        cache: &ConnectionCache,
        cancel: &CancellationToken,
    ) -> Result<()> {
        coordinator.wait_for_dependency(cancel, &app.name).await?;
        debug!(session = %session, app = %app.name, "deploying app");

        let clusters = app.active_clusters().map(|cluster| {
            self.deploy_cluster(session, &app.name, cluster, op, coordinator, cache, cancel)
        });
        first_error(join_all(clusters).await)?;

        self.status.mark_deployed(session, &app.name);
        coordinator.notify_applied_status(&app.name);
        info!(session = %session, app = %app.name, "app deployed");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn deploy_cluster(
        &self,
        session: &str,
        app: &str,
        cluster: &Cluster,
        op: OpKind,
        coordinator: &DependencyCoordinator,
        cache: &ConnectionCache,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let waves = plan_waves(app, cluster)?;
        let client = self.client(cache, &cluster.name).await?;

        client.apply_config(app).await?;
        client.apply_status_cr(app).await?;
        self.start_watcher(session, app, client.as_ref()).await?;

        for wave in waves {
            for dep in &wave.waits {
                debug!(app = %app, cluster = %cluster.name, resource = %dep, "waiting for resource");
                coordinator
                    .wait_resource_dependency(cancel, app, &cluster.name, dep)
                    .await?;
            }
            let mut acc = client.new_accumulator(op)?;
            for res in wave.resources {
                let staged = StagedResource {
                    name: res.name.clone(),
                    manifest: res.data.clone(),
                    approval: res.approval.clone(),
                };
                acc = match op {
                    OpKind::Create => client.create(acc, app, &staged).await?,
                    OpKind::Apply => client.apply(acc, app, &staged).await?,
                    OpKind::Delete => client.delete(acc, app, &staged).await?,
                };
            }
            let report = client.commit(app, acc).await?;
            self.record_report(session, app, &cluster.name, &report, ResourceOutcome::Applied);
            report.into_result(&cluster.name, client.backend_type())?;
        }
        debug!(session = %session, app = %app, cluster = %cluster.name, "cluster deployed");
        Ok(())
    }

    async fn start_watcher(&self, session: &str, app: &str, client: &dyn ClientProvider) -> Result<()> {
        let key = (session.to_string(), app.to_string(), client.cluster().to_string());
        let first = self.watched.lock().insert(key.clone());
        if !first {
            return Ok(());
        }
        if let Err(e) = client.start_cluster_watcher(app).await {
            self.watched.lock().remove(&key);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a session's resources, apps in reverse order.
    ///
    /// With `keep`, resources the replacement session still declares on the
    /// same cluster are kept when the backend identifies them by cluster.
    /// With `reached_only`, clusters this session never connected to are
    /// skipped. Every app is attempted; the first failure is returned.
    async fn remove_session(
        &self,
        record: &SessionRecord,
        keep: Option<&SessionRecord>,
        reached_only: bool,
    ) -> Result<()> {
        let cache = self.connector.cache(&record.id).await;
        let apps: Vec<&App> = record.app.ordered_apps().collect();
        let mut results = Vec::new();
        for app in apps.into_iter().rev() {
            let clusters = app.active_clusters().map(|cluster| {
                let kept = keep
                    .and_then(|k| k.app.app(&app.name))
                    .and_then(|a| a.clusters.get(&cluster.name))
                    .filter(|c| !c.skip);
                self.remove_cluster(&record.id, &app.name, cluster, kept, &cache, reached_only)
            });
            let result = first_error(join_all(clusters).await);
            if let Err(e) = &result {
                error!(session = %record.id, app = %app.name, error = %e, "app removal failed");
            }
            self.status.unmark_deployed(&record.id, &app.name);
            results.push(result);
        }
        first_error(results)
    }

    async fn remove_cluster(
        &self,
        session: &str,
        app: &str,
        cluster: &Cluster,
        kept: Option<&Cluster>,
        cache: &ConnectionCache,
        reached_only: bool,
    ) -> Result<()> {
        if reached_only && !cache.has_client(&cluster.name).await {
            debug!(session = %session, app = %app, cluster = %cluster.name, "cluster never reached, nothing to remove");
            return Ok(());
        }
        let client = self.client(cache, &cluster.name).await?;
        let keep: BTreeSet<&str> = match (client.identity_scope(), kept) {
            (IdentityScope::Cluster, Some(kept)) => kept
                .ordered_resources()
                .map(|r| r.name.as_str())
                .collect(),
            _ => BTreeSet::new(),
        };

        let mut acc = client.new_accumulator(OpKind::Delete)?;
        let mut staged_any = false;
        let resources: Vec<_> = cluster.ordered_resources().collect();
        for res in resources.into_iter().rev() {
            if keep.contains(res.name.as_str()) {
                debug!(app = %app, cluster = %cluster.name, resource = %res.name, "kept by replacement");
                continue;
            }
            let staged = StagedResource::new(res.name.clone(), res.data.clone());
            acc = client.delete(acc, app, &staged).await?;
            staged_any = true;
        }
        if staged_any {
            let report = client.commit(app, acc).await?;
            self.record_report(session, app, &cluster.name, &report, ResourceOutcome::Deleted);
            report.into_result(&cluster.name, client.backend_type())?;
        }

        if let Err(e) = client.delete_status_cr(app).await {
            warn!(session = %session, app = %app, cluster = %cluster.name, error = %e, "failed to delete status object");
        }
        if let Err(e) = client.delete_config(app).await {
            warn!(session = %session, app = %app, cluster = %cluster.name, error = %e, "failed to delete sync configuration");
        }
        debug!(session = %session, app = %app, cluster = %cluster.name, "cluster cleaned up");
        Ok(())
    }

    async fn client(&self, cache: &ConnectionCache, cluster: &str) -> Result<Arc<dyn ClientProvider>> {
        cache
            .get_client_with_retry(
                cluster,
                &self.settings.credential_level,
                &self.settings.credential_namespace,
            )
            .await
    }

    fn record_report(
        &self,
        session: &str,
        app: &str,
        cluster: &str,
        report: &CommitReport,
        success: ResourceOutcome,
    ) {
        for resource in &report.succeeded {
            self.status
                .record_outcome(session, app, cluster, resource, success.clone());
        }
        for failure in &report.failed {
            self.status.record_outcome(
                session,
                app,
                cluster,
                &failure.resource,
                ResourceOutcome::Failed(failure.reason.clone()),
            );
        }
    }
}

/// First real failure of a set of results.
///
/// Cancellations caused by another failure are only reported when nothing
/// else failed.
fn first_error(results: Vec<Result<()>>) -> Result<()> {
    let mut cancelled = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(e @ Error::Cancelled { .. }) => {
                cancelled.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    cancelled.map_or(Ok(()), Err)
}
