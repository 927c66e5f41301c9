//! Per-session dependency coordinator
//!
//! Waiters are registered per dependency label in two lists, one for
//! `Deployed` and one for `Ready`. Every waiter of an app signals the same
//! fan-in channel with its own id, so the app's wait is a counter of
//! outstanding ids racing the cancellation tokens. Notifications drain the
//! waiters they fire; each fired waiter gets its own task so a grace delay
//! never holds up anyone else.
//!
//! Single-resource waits poll the readiness probe on a fast first check and
//! a slower steady interval, and are also fired early by [`resources_ready`].
//!
//! [`resources_ready`]: DependencyCoordinator::resources_ready

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rsync_common::types::{app_cluster_key, split_resource_name};
use rsync_common::{Criteria, Error, OpStatus, Result};

/// Poll cadence of single-resource waits
#[derive(Clone, Debug)]
pub struct DependencySettings {
    /// Delay before the first direct check
    pub resource_first_check: Duration,
    /// Delay between later checks
    pub resource_poll: Duration,
}

impl Default for DependencySettings {
    fn default() -> Self {
        Self {
            resource_first_check: Duration::from_secs(1),
            resource_poll: Duration::from_secs(30),
        }
    }
}

/// Direct status queries backing the coordinator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Every cluster `app` targets in the session
    async fn app_clusters(&self, session: &str, app: &str) -> Result<Vec<String>>;

    /// Whether `app` reports ready on one cluster
    async fn is_app_ready_on(&self, session: &str, app: &str, cluster: &str) -> bool;

    /// Whether `app` has been committed to all of its clusters
    async fn is_app_deployed(&self, session: &str, app: &str) -> bool;

    /// Whether a resource is ready
    async fn is_resource_ready(
        &self,
        session: &str,
        app: &str,
        cluster: &str,
        name: &str,
        kind: &str,
    ) -> bool;

    /// Whether a run-to-completion resource has succeeded
    async fn is_resource_succeeded(
        &self,
        session: &str,
        app: &str,
        cluster: &str,
        name: &str,
        kind: &str,
    ) -> bool;
}

struct AppWaiter {
    id: u64,
    app: String,
    criteria: Criteria,
    tx: mpsc::UnboundedSender<u64>,
}

struct Pending {
    outstanding: HashSet<u64>,
    tx: mpsc::UnboundedSender<u64>,
    rx: mpsc::UnboundedReceiver<u64>,
}

impl Pending {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            outstanding: HashSet::new(),
            tx,
            rx,
        }
    }
}

struct ResourceWaiter {
    id: u64,
    resource: String,
    tx: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct State {
    deployed: HashMap<String, Vec<AppWaiter>>,
    ready: HashMap<String, Vec<AppWaiter>>,
    pending: HashMap<String, Pending>,
    resources: HashMap<String, Vec<ResourceWaiter>>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn purge_app(&mut self, app: &str) {
        for lists in [&mut self.deployed, &mut self.ready] {
            lists.retain(|_, waiters| {
                waiters.retain(|w| w.app != app);
                !waiters.is_empty()
            });
        }
    }

    fn purge_resource(&mut self, key: &str, id: u64) {
        if let Some(waiters) = self.resources.get_mut(key) {
            waiters.retain(|w| w.id != id);
            if waiters.is_empty() {
                self.resources.remove(key);
            }
        }
    }

    /// Labels `app` still waits on, with the status each waits for
    fn dependencies_of(&self, app: &str) -> Vec<(String, OpStatus)> {
        let mut deps = Vec::new();
        for (status, lists) in [(OpStatus::Deployed, &self.deployed), (OpStatus::Ready, &self.ready)] {
            for (label, waiters) in lists {
                if waiters.iter().any(|w| w.app == app) {
                    deps.push((label.clone(), status));
                }
            }
        }
        deps
    }
}

struct Inner {
    session: String,
    probe: Arc<dyn ReadinessProbe>,
    settings: DependencySettings,
    state: RwLock<State>,
    disposed: CancellationToken,
}

/// Drops every app-level waiter of one app when its wait returns
struct AppWaitGuard<'a> {
    inner: &'a Inner,
    app: &'a str,
}

impl Drop for AppWaitGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.write().purge_app(self.app);
    }
}

/// Drops one resource waiter when its wait returns
struct ResourceWaitGuard<'a> {
    inner: &'a Inner,
    key: String,
    id: u64,
}

impl Drop for ResourceWaitGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.write().purge_resource(&self.key, self.id);
    }
}

/// Dependency coordinator of one deployment session
#[derive(Clone)]
pub struct DependencyCoordinator {
    inner: Arc<Inner>,
}

impl DependencyCoordinator {
    /// Coordinator for `session` answering direct queries through `probe`
    pub fn new(
        session: impl Into<String>,
        probe: Arc<dyn ReadinessProbe>,
        settings: DependencySettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: session.into(),
                probe,
                settings,
                state: RwLock::new(State::default()),
                disposed: CancellationToken::new(),
            }),
        }
    }

    /// Session this coordinator serves
    pub fn session(&self) -> &str {
        &self.inner.session
    }

    /// Register one waiter per dependency of `app`.
    ///
    /// Criteria other than `Deployed` and `Ready` are ignored.
    pub fn add_dependency(&self, app: &str, dependencies: &BTreeMap<String, Criteria>) {
        let mut state = self.inner.state.write();
        for (label, criteria) in dependencies {
            let id = state.next_id();
            let tx = state
                .pending
                .entry(app.to_string())
                .or_insert_with(Pending::new)
                .tx
                .clone();
            let waiter = AppWaiter {
                id,
                app: app.to_string(),
                criteria: criteria.clone(),
                tx,
            };
            match criteria.op_status {
                OpStatus::Deployed => state.deployed.entry(label.clone()).or_default().push(waiter),
                OpStatus::Ready => state.ready.entry(label.clone()).or_default().push(waiter),
                OpStatus::Unknown => {
                    debug!(session = %self.inner.session, app = %app, dependency = %label, "ignoring dependency with unknown status");
                    continue;
                }
            }
            if let Some(pending) = state.pending.get_mut(app) {
                pending.outstanding.insert(id);
            }
        }
    }

    /// Block until every dependency registered for `app` is satisfied.
    ///
    /// Returns at once when `app` has none. Every waiter of `app` is dropped
    /// on return, whether satisfied, cancelled, or disposed.
    pub async fn wait_for_dependency(&self, cancel: &CancellationToken, app: &str) -> Result<()> {
        let pending = self.inner.state.write().pending.remove(app);
        let _guard = AppWaitGuard {
            inner: &self.inner,
            app,
        };
        let Some(mut pending) = pending else {
            return Ok(());
        };
        if pending.outstanding.is_empty() {
            return Ok(());
        }

        // Dependencies satisfied before registration would never be notified
        let dependencies = self.inner.state.read().dependencies_of(app);
        for (label, status) in dependencies {
            match status {
                OpStatus::Deployed => {
                    if self.inner.probe.is_app_deployed(&self.inner.session, &label).await {
                        self.notify_applied_status(&label);
                    }
                }
                _ => {
                    if self.is_ready_everywhere(&label).await {
                        self.notify_ready_status(&label);
                    }
                }
            }
        }

        debug!(
            session = %self.inner.session,
            app = %app,
            outstanding = pending.outstanding.len(),
            "waiting for dependencies"
        );
        while !pending.outstanding.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::cancelled(format!("dependencies of {app}")));
                }
                _ = self.inner.disposed.cancelled() => {
                    return Err(Error::cancelled(format!("dependencies of {app}: session disposed")));
                }
                id = pending.rx.recv() => match id {
                    Some(id) => {
                        pending.outstanding.remove(&id);
                    }
                    None => return Err(Error::internal_with_context(app, "dependency channel closed")),
                },
            }
        }
        debug!(session = %self.inner.session, app = %app, "dependencies satisfied");
        Ok(())
    }

    /// Fire every `Deployed` waiter on `label`
    pub fn notify_applied_status(&self, label: &str) {
        let waiters = self.inner.state.write().deployed.remove(label);
        Self::fire(label, waiters.unwrap_or_default());
    }

    /// Fire every `Ready` waiter on `label`
    pub fn notify_ready_status(&self, label: &str) {
        let waiters = self.inner.state.write().ready.remove(label);
        Self::fire(label, waiters.unwrap_or_default());
    }

    fn fire(label: &str, waiters: Vec<AppWaiter>) {
        for waiter in waiters {
            let label = label.to_string();
            tokio::spawn(async move {
                if waiter.criteria.wait_seconds > 0 {
                    sleep(Duration::from_secs(waiter.criteria.wait_seconds)).await;
                }
                debug!(app = %waiter.app, dependency = %label, "dependency satisfied");
                // The app may have stopped waiting
                let _ = waiter.tx.send(waiter.id);
            });
        }
    }

    /// Something about `app` on `cluster` may have become ready.
    ///
    /// Does nothing unless a `Ready` waiter on `app` or a resource waiter on
    /// `app` and `cluster` is registered. Re-evaluation runs in the
    /// background.
    pub fn resources_ready(&self, app: &str, cluster: &str) {
        let key = app_cluster_key(app, cluster);
        let (app_waiters, resources) = {
            let state = self.inner.state.read();
            let app_waiters = state.ready.get(app).is_some_and(|w| !w.is_empty());
            let resources: Vec<String> = state
                .resources
                .get(&key)
                .map(|waiters| {
                    waiters
                        .iter()
                        .filter(|w| w.tx.is_some())
                        .map(|w| w.resource.clone())
                        .collect()
                })
                .unwrap_or_default();
            (app_waiters, resources)
        };

        if app_waiters {
            let this = self.clone();
            let app = app.to_string();
            tokio::spawn(async move {
                if this.is_ready_everywhere(&app).await {
                    this.notify_ready_status(&app);
                }
            });
        }

        if !resources.is_empty() {
            let this = self.clone();
            let (app, cluster) = (app.to_string(), cluster.to_string());
            tokio::spawn(async move {
                let mut seen = HashSet::new();
                for resource in resources {
                    if seen.insert(resource.clone())
                        && this.get_resource_ready_status(&app, &cluster, &resource).await
                    {
                        this.fire_resource(&key, &resource);
                    }
                }
            });
        }
    }

    fn fire_resource(&self, key: &str, resource: &str) {
        let mut state = self.inner.state.write();
        let Some(waiters) = state.resources.get_mut(key) else {
            return;
        };
        for waiter in waiters.iter_mut().filter(|w| w.resource == resource) {
            if let Some(tx) = waiter.tx.take() {
                let _ = tx.send(());
            }
        }
    }

    /// An app is ready only once it reports ready on every cluster it targets
    async fn is_ready_everywhere(&self, app: &str) -> bool {
        let session = &self.inner.session;
        let clusters = match self.inner.probe.app_clusters(session, app).await {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!(session = %session, app = %app, error = %e, "cannot list clusters of dependency");
                return false;
            }
        };
        for cluster in &clusters {
            if !self.inner.probe.is_app_ready_on(session, app, cluster).await {
                return false;
            }
        }
        true
    }

    /// Whether a `name+kind` resource has reached its ready condition.
    ///
    /// Pods and jobs must have succeeded; everything else must be ready.
    pub async fn get_resource_ready_status(&self, app: &str, cluster: &str, resource: &str) -> bool {
        let (name, kind) = split_resource_name(resource);
        let probe = &self.inner.probe;
        match kind {
            "Pod" | "Job" => {
                probe
                    .is_resource_succeeded(&self.inner.session, app, cluster, name, kind)
                    .await
            }
            _ => {
                probe
                    .is_resource_ready(&self.inner.session, app, cluster, name, kind)
                    .await
            }
        }
    }

    /// Block until one resource of `app` on `cluster` is ready
    pub async fn wait_resource_dependency(
        &self,
        cancel: &CancellationToken,
        app: &str,
        cluster: &str,
        resource: &str,
    ) -> Result<()> {
        let key = app_cluster_key(app, cluster);
        let (tx, mut rx) = oneshot::channel();
        let id = {
            let mut state = self.inner.state.write();
            let id = state.next_id();
            state.resources.entry(key.clone()).or_default().push(ResourceWaiter {
                id,
                resource: resource.to_string(),
                tx: Some(tx),
            });
            id
        };
        let _guard = ResourceWaitGuard {
            inner: &self.inner,
            key,
            id,
        };

        let mut next_check = Instant::now() + self.inner.settings.resource_first_check;
        let mut notified_open = true;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::cancelled(format!("{resource} of {app} on {cluster}")));
                }
                _ = self.inner.disposed.cancelled() => {
                    return Err(Error::cancelled(format!("{resource} of {app} on {cluster}: session disposed")));
                }
                fired = &mut rx, if notified_open => {
                    if fired.is_ok() {
                        debug!(app = %app, cluster = %cluster, resource = %resource, "resource ready");
                        return Ok(());
                    }
                    notified_open = false;
                }
                _ = sleep_until(next_check) => {
                    if self.get_resource_ready_status(app, cluster, resource).await {
                        debug!(app = %app, cluster = %cluster, resource = %resource, "resource ready on poll");
                        return Ok(());
                    }
                    next_check = Instant::now() + self.inner.settings.resource_poll;
                }
            }
        }
    }

    /// Number of registered app and resource waiters
    pub fn waiter_count(&self) -> usize {
        let state = self.inner.state.read();
        let app_waiters: usize = state
            .deployed
            .values()
            .chain(state.ready.values())
            .map(Vec::len)
            .sum();
        let resource_waiters: usize = state.resources.values().map(Vec::len).sum();
        app_waiters + resource_waiters
    }

    /// Drop every waiter; blocked waits return `Cancelled`
    pub fn dispose(&self) {
        self.inner.disposed.cancel();
        *self.inner.state.write() = State::default();
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_cancelled()
    }
}
