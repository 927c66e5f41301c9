//! In-memory backend that records what the engine asks of it
//!
//! Committed resources land in a shared object map. Every commit reports the
//! app's objects back through the watch sink as ready, with jobs and pods
//! reported as succeeded, so dependency waits resolve without a cluster.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};

use rsync::{Engine, EngineSettings};
use rsync_common::types::split_resource_name;
use rsync_common::{
    App, AppResource, Cluster, CompositeApp, Criteria, ResourceBundleStatus, Result,
};
use rsync_provider::provider::FileSet;
use rsync_provider::{
    Accumulator, BackendContext, BackendFactory, BackendRegistry, ClientProvider, CommitReport,
    IdentityScope, OpKind, StagedResource, WatchSink,
};
use rsync_store::{CloudConfig, MemoryStore, SessionRecord};

/// A committed object
#[derive(Clone, Debug, PartialEq)]
pub struct Object {
    pub session: String,
    pub app: String,
    pub resource: String,
    pub manifest: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, String), Object>,
    log: Vec<String>,
    failing: HashSet<String>,
    status_crs: BTreeSet<(String, String, String)>,
    watchers: Vec<(String, String, String)>,
}

/// Shared view of everything the recording backends did
#[derive(Clone, Default)]
pub struct Recorder {
    state: Arc<Mutex<State>>,
}

impl Recorder {
    /// Creates and applies of `resource` fail from now on
    pub fn fail(&self, resource: &str) {
        self.state.lock().unwrap().failing.insert(resource.to_string());
    }

    /// Object `resource` on `cluster` as stored under `identity`
    pub fn object(&self, cluster: &str, identity: &str) -> Option<Object> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(cluster.to_string(), identity.to_string()))
            .cloned()
    }

    /// Number of stored objects belonging to `session`
    pub fn objects_of(&self, session: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .objects
            .values()
            .filter(|o| o.session == session)
            .count()
    }

    /// Operation log, one `op session cluster resource` line per staged change
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    /// Index of the first log line containing `needle`
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.log().iter().position(|line| line.contains(needle))
    }

    /// Whether a status object exists for the session and app on `cluster`
    pub fn has_status_cr(&self, session: &str, app: &str, cluster: &str) -> bool {
        self.state.lock().unwrap().status_crs.contains(&(
            session.to_string(),
            app.to_string(),
            cluster.to_string(),
        ))
    }

    /// Number of watchers started
    pub fn watcher_count(&self) -> usize {
        self.state.lock().unwrap().watchers.len()
    }
}

struct RecordingProvider {
    recorder: Recorder,
    session: String,
    cluster: String,
    scope: IdentityScope,
    sink: Arc<dyn WatchSink>,
}

impl RecordingProvider {
    fn identity(&self, resource: &str) -> String {
        match self.scope {
            IdentityScope::Cluster => resource.to_string(),
            IdentityScope::Session => format!("{}/{resource}", self.session),
        }
    }

    fn stage(&self, acc: Accumulator, op: OpKind, res: &StagedResource, content: Option<String>) -> Accumulator {
        let Accumulator::GitOps(mut files) = acc else {
            panic!("recording backend got a foreign accumulator");
        };
        self.recorder.state.lock().unwrap().log.push(format!(
            "{op} {} {} {}",
            self.session, self.cluster, res.name
        ));
        let key = format!("{op}:{}", res.name);
        files.changes.insert(key, content);
        files.resources.push(res.name.clone());
        Accumulator::GitOps(files)
    }

    /// What the app looks like on this cluster, as an agent would report it
    fn report(&self, app: &str) -> ResourceBundleStatus {
        let state = self.recorder.state.lock().unwrap();
        let mut lists: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        let mut count = 0;
        for ((cluster, _), object) in &state.objects {
            if cluster != &self.cluster || object.session != self.session || object.app != app {
                continue;
            }
            count += 1;
            let (name, kind) = split_resource_name(&object.resource);
            let meta = json!({"name": name});
            let (list, entry) = match kind {
                "Job" => (
                    "jobStatuses",
                    json!({"apiVersion": "batch/v1", "kind": kind, "metadata": meta, "status": {"succeeded": 1}}),
                ),
                "Pod" => (
                    "podStatuses",
                    json!({"apiVersion": "v1", "kind": kind, "metadata": meta, "status": {"phase": "Succeeded"}}),
                ),
                "Deployment" => (
                    "deploymentStatuses",
                    json!({"apiVersion": "apps/v1", "kind": kind, "metadata": meta, "status": {"readyReplicas": 1}}),
                ),
                "Service" => (
                    "serviceStatuses",
                    json!({"apiVersion": "v1", "kind": kind, "metadata": meta}),
                ),
                "ConfigMap" => (
                    "configMapStatuses",
                    json!({"apiVersion": "v1", "kind": kind, "metadata": meta}),
                ),
                _ => ("resourceStatuses", json!({"kind": kind, "name": name})),
            };
            lists.entry(list).or_default().push(entry);
        }
        let mut report = json!({"ready": true, "resourceCount": count});
        for (list, entries) in lists {
            report[list] = Value::Array(entries);
        }
        serde_json::from_value(report).unwrap()
    }
}

#[async_trait]
impl ClientProvider for RecordingProvider {
    fn backend_type(&self) -> &str {
        "recording"
    }

    fn session(&self) -> &str {
        &self.session
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn identity_scope(&self) -> IdentityScope {
        self.scope
    }

    fn new_accumulator(&self, _op: OpKind) -> Result<Accumulator> {
        Ok(Accumulator::GitOps(FileSet::default()))
    }

    async fn create(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator> {
        let manifest = self.tag_resource(&res.manifest, app)?;
        Ok(self.stage(acc, OpKind::Create, res, Some(manifest)))
    }

    async fn apply(&self, acc: Accumulator, app: &str, res: &StagedResource) -> Result<Accumulator> {
        let manifest = self.tag_resource(&res.manifest, app)?;
        Ok(self.stage(acc, OpKind::Apply, res, Some(manifest)))
    }

    async fn delete(&self, acc: Accumulator, _app: &str, res: &StagedResource) -> Result<Accumulator> {
        Ok(self.stage(acc, OpKind::Delete, res, None))
    }

    async fn commit(&self, app: &str, acc: Accumulator) -> Result<CommitReport> {
        let Accumulator::GitOps(files) = acc else {
            panic!("recording backend got a foreign accumulator");
        };
        let mut report = CommitReport::default();
        {
            let mut state = self.recorder.state.lock().unwrap();
            for (key, content) in files.changes {
                let (op, resource) = key.split_once(':').unwrap();
                if content.is_some() && state.failing.contains(resource) {
                    report.failure(resource, "rejected by recorder");
                    continue;
                }
                let slot = (self.cluster.clone(), self.identity(resource));
                let object = content.map(|manifest| Object {
                    session: self.session.clone(),
                    app: app.to_string(),
                    resource: resource.to_string(),
                    manifest,
                });
                match (op, object) {
                    ("create", Some(object)) => {
                        state.objects.entry(slot).or_insert(object);
                    }
                    (_, Some(object)) => {
                        state.objects.insert(slot, object);
                    }
                    (_, None) => {
                        state.objects.remove(&slot);
                    }
                }
                report.success(resource);
            }
        }
        let status = self.report(app);
        self.sink.observe(&self.session, app, &self.cluster, status).await;
        Ok(report)
    }

    async fn get(&self, _app: &str, res: &StagedResource) -> Result<Option<Value>> {
        Ok(self
            .recorder
            .object(&self.cluster, &self.identity(&res.name))
            .map(|o| Value::String(o.manifest)))
    }

    async fn is_reachable(&self) -> Result<()> {
        Ok(())
    }

    async fn start_cluster_watcher(&self, app: &str) -> Result<()> {
        self.recorder.state.lock().unwrap().watchers.push((
            self.session.clone(),
            app.to_string(),
            self.cluster.clone(),
        ));
        Ok(())
    }

    async fn apply_status_cr(&self, app: &str) -> Result<()> {
        self.recorder.state.lock().unwrap().status_crs.insert((
            self.session.clone(),
            app.to_string(),
            self.cluster.clone(),
        ));
        Ok(())
    }

    async fn delete_status_cr(&self, app: &str) -> Result<()> {
        self.recorder.state.lock().unwrap().status_crs.remove(&(
            self.session.clone(),
            app.to_string(),
            self.cluster.clone(),
        ));
        Ok(())
    }
}

struct RecordingFactory {
    recorder: Recorder,
    scope: IdentityScope,
}

#[async_trait]
impl BackendFactory for RecordingFactory {
    async fn build(&self, ctx: BackendContext) -> Result<Arc<dyn ClientProvider>> {
        Ok(Arc::new(RecordingProvider {
            recorder: self.recorder.clone(),
            session: ctx.session,
            cluster: ctx.cluster.to_string(),
            scope: self.scope,
            sink: ctx.sink,
        }))
    }
}

/// Engine whose direct backend is a recorder
pub struct Harness {
    pub engine: Arc<Engine>,
    pub recorder: Recorder,
    _work_dir: tempfile::TempDir,
}

impl Harness {
    /// Engine with the recorder serving clusters with direct credentials
    pub async fn new(scope: IdentityScope) -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let mut registry = BackendRegistry::new();
        registry.register(
            "k8s",
            Arc::new(RecordingFactory {
                recorder: recorder.clone(),
                scope,
            }),
        );
        let mut settings = EngineSettings::with_work_dir(work_dir.path());
        settings.dependency.resource_first_check = std::time::Duration::from_millis(10);
        settings.dependency.resource_poll = std::time::Duration::from_millis(50);
        let engine = Arc::new(Engine::new(Arc::new(MemoryStore::new()), registry, settings));

        for cluster in ["core", "edge"] {
            engine
                .credentials()
                .create(CloudConfig {
                    provider: "aws".to_string(),
                    cluster: cluster.to_string(),
                    level: "0".to_string(),
                    namespace: "default".to_string(),
                    config: base64::engine::general_purpose::STANDARD.encode("apiVersion: v1"),
                })
                .await
                .unwrap();
        }

        Self {
            engine,
            recorder,
            _work_dir: work_dir,
        }
    }

    /// Store a fresh session
    pub async fn session(&self, id: &str, app: CompositeApp) {
        self.engine
            .sessions()
            .put(&SessionRecord::new(id, app))
            .await
            .unwrap();
    }
}

/// Manifest for a `name+kind` resource
pub fn manifest(resource: &str, payload: &str) -> String {
    let (name, kind) = split_resource_name(resource);
    let api_version = match kind {
        "Deployment" | "StatefulSet" => "apps/v1",
        "Job" => "batch/v1",
        _ => "v1",
    };
    format!(
        "apiVersion: {api_version}\nkind: {kind}\nmetadata:\n  name: {name}\n  annotations:\n    payload: \"{payload}\"\n"
    )
}

/// One cluster with resources applied in the given order
pub fn cluster(name: &str, resources: &[&str], payload: &str) -> Cluster {
    Cluster {
        name: name.to_string(),
        res_order: resources.iter().map(|r| r.to_string()).collect(),
        resources: resources
            .iter()
            .map(|r| {
                (
                    r.to_string(),
                    AppResource {
                        name: r.to_string(),
                        data: manifest(r, payload),
                        ..Default::default()
                    },
                )
            })
            .collect(),
        ..Default::default()
    }
}

/// An app on the given clusters
pub fn app(name: &str, clusters: Vec<Cluster>, dependency: &[(&str, Criteria)]) -> App {
    App {
        name: name.to_string(),
        clusters: clusters.into_iter().map(|c| (c.name.clone(), c)).collect(),
        dependency: dependency
            .iter()
            .map(|(label, c)| (label.to_string(), c.clone()))
            .collect(),
        skip: false,
    }
}

/// A composite app deploying `apps` in order
pub fn composite(apps: Vec<App>) -> CompositeApp {
    CompositeApp {
        name: "shop".to_string(),
        app_order: apps.iter().map(|a| a.name.clone()).collect(),
        apps: apps.into_iter().map(|a| (a.name.clone(), a)).collect(),
        ..Default::default()
    }
}
