//! Cluster connection cache
//!
//! One [`ConnectionCache`] per deployment session holds a provider per
//! `provider+cluster`. Credentials are looked up, not owned: on a miss they
//! are read from the credential store, materialized into the session's
//! working directory, and handed to the backend registry.
//!
//! Cluster-level credentials are found in whatever namespace they were last
//! moved to, so a `set_namespace` does not strand running sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use rsync_common::{ClusterName, Error, Result, CLUSTER_LEVEL};
use rsync_provider::{
    BackendContext, BackendRegistry, ClientProvider, Credentials, ProviderSettings, WatchSink,
};
use rsync_store::CredentialStore;

const KUBECONFIG_FILE: &str = "config";

/// Connection settings shared by every session
#[derive(Clone, Debug)]
pub struct ConnectorSettings {
    /// Root of per-session working directories
    pub work_dir: PathBuf,
    /// Backend serving clusters with direct credentials (`k8s` or `k8s-batch`)
    pub direct_backend: String,
    /// Settings handed to every provider
    pub provider: ProviderSettings,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/rsync"),
            direct_backend: "k8s".to_string(),
            provider: ProviderSettings::default(),
        }
    }
}

/// Builds connection caches and tracks the live one of each session
#[derive(Clone)]
pub struct Connector {
    credentials: CredentialStore,
    registry: Arc<BackendRegistry>,
    sink: Arc<dyn WatchSink>,
    settings: Arc<ConnectorSettings>,
    sessions: Arc<Mutex<HashMap<String, Arc<ConnectionCache>>>>,
}

impl Connector {
    /// Connector resolving credentials from `credentials` and building through `registry`
    pub fn new(
        credentials: CredentialStore,
        registry: Arc<BackendRegistry>,
        sink: Arc<dyn WatchSink>,
        settings: ConnectorSettings,
    ) -> Self {
        Self {
            credentials,
            registry,
            sink,
            settings: Arc::new(settings),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The cache of `session`, created on first use
    pub async fn cache(&self, session: &str) -> Arc<ConnectionCache> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session.to_string())
            .or_insert_with(|| Arc::new(ConnectionCache::new(session, self.clone())))
            .clone()
    }

    /// Tear down the cache of `session`, if any
    pub async fn release(&self, session: &str) {
        let cache = self.sessions.lock().await.remove(session);
        if let Some(cache) = cache {
            cache.teardown().await;
        }
    }
}

/// Providers of one session, keyed by `provider+cluster`
pub struct ConnectionCache {
    session: String,
    connector: Connector,
    clients: Mutex<HashMap<String, Arc<dyn ClientProvider>>>,
    cancel: CancellationToken,
}

impl ConnectionCache {
    fn new(session: &str, connector: Connector) -> Self {
        Self {
            session: session.to_string(),
            connector,
            clients: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Session this cache serves
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Working directory of the session
    pub fn work_dir(&self) -> PathBuf {
        self.connector.settings.work_dir.join(&self.session)
    }

    fn cluster_dir(&self, cluster: &ClusterName) -> PathBuf {
        self.work_dir().join(cluster.to_string())
    }

    /// Cancelled when the cache is torn down; watchers started through it stop
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Provider for `cluster` (`provider+cluster`), built on first use.
    ///
    /// Concurrent calls are serialized; only one construction runs and its
    /// result is shared.
    #[instrument(skip(self), fields(session = %self.session))]
    pub async fn get_client(
        &self,
        cluster: &str,
        level: &str,
        namespace: &str,
    ) -> Result<Arc<dyn ClientProvider>> {
        let name: ClusterName = cluster.parse()?;
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(cluster) {
            return Ok(client.clone());
        }

        let (backend, credentials, namespace) = self.resolve(&name, level, namespace).await?;
        let ctx = BackendContext {
            session: self.session.clone(),
            cluster: name.clone(),
            level: level.to_string(),
            namespace,
            credentials,
            work_dir: self.cluster_dir(&name),
            sink: self.connector.sink.clone(),
            cancel: self.cancel.child_token(),
            settings: self.connector.settings.provider.clone(),
        };
        let client = self.connector.registry.build(&backend, ctx).await?;
        info!(cluster = %cluster, backend = %backend, "cluster client ready");
        clients.insert(cluster.to_string(), client.clone());
        Ok(client)
    }

    /// [`get_client`](Self::get_client) plus one reachability probe.
    ///
    /// A failed probe surfaces as `ClusterUnreachable`; retrying is up to the caller.
    pub async fn get_client_with_retry(
        &self,
        cluster: &str,
        level: &str,
        namespace: &str,
    ) -> Result<Arc<dyn ClientProvider>> {
        let client = self.get_client(cluster, level, namespace).await?;
        match client.is_reachable().await {
            Ok(()) => Ok(client),
            Err(e @ Error::ClusterUnreachable { .. }) => Err(e),
            Err(e) => Err(Error::unreachable(cluster, e.to_string())),
        }
    }

    /// Whether a provider for `cluster` was built in this session
    pub async fn has_client(&self, cluster: &str) -> bool {
        self.clients.lock().await.contains_key(cluster)
    }

    /// Drop the provider of `cluster` and its materialized credentials
    pub async fn remove_client(&self, cluster: &str) -> bool {
        let removed = self.clients.lock().await.remove(cluster).is_some();
        if let Ok(name) = cluster.parse::<ClusterName>() {
            remove_dir(&self.cluster_dir(&name)).await;
        }
        removed
    }

    /// Drop every provider, stop their watchers, and delete the session directory
    pub async fn teardown(&self) {
        self.cancel.cancel();
        self.clients.lock().await.clear();
        remove_dir(&self.work_dir()).await;
        debug!(session = %self.session, "connection cache torn down");
    }

    /// Backend, credentials and credential namespace serving `name`
    async fn resolve(
        &self,
        name: &ClusterName,
        level: &str,
        namespace: &str,
    ) -> Result<(String, Credentials, String)> {
        let store = &self.connector.credentials;
        let direct = match store.get(&name.provider, &name.cluster, level, namespace).await {
            Err(e) if e.is_not_found() && level == CLUSTER_LEVEL => {
                store.get_cluster_config(&name.provider, &name.cluster).await
            }
            other => other,
        };
        match direct {
            Ok(config) => {
                if config.namespace != namespace {
                    debug!(cluster = %name, namespace = %config.namespace, "credentials found in moved namespace");
                }
                let path = write_kubeconfig(&self.cluster_dir(name), &config.config).await?;
                Ok((
                    self.connector.settings.direct_backend.clone(),
                    Credentials::Kubeconfig(path),
                    config.namespace,
                ))
            }
            Err(e) if e.is_not_found() => {
                let descriptor = store.get_gitops(&name.provider, &name.cluster).await?;
                if descriptor.provider_type.is_empty() {
                    return Err(Error::configuration(
                        name.to_string(),
                        "git-ops descriptor has no provider type",
                    ));
                }
                Ok((
                    descriptor.provider_type.clone(),
                    Credentials::GitOps(descriptor),
                    namespace.to_string(),
                ))
            }
            Err(e) => Err(e),
        }
    }
}

async fn write_kubeconfig(dir: &Path, encoded: &str) -> Result<PathBuf> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::configuration("cloud config", format!("kubeconfig is not base64: {e}")))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::internal_with_context("work dir", format!("{}: {e}", dir.display())))?;
    let path = dir.join(KUBECONFIG_FILE);
    tokio::fs::write(&path, decoded)
        .await
        .map_err(|e| Error::internal_with_context("work dir", format!("{}: {e}", path.display())))?;
    Ok(path)
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove working directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;

    use rsync_common::ResourceBundleStatus;
    use rsync_provider::{
        Accumulator, BackendFactory, CommitReport, IdentityScope, OpKind, StagedResource,
    };
    use rsync_store::{CloudConfig, GitOpsDescriptor, MemoryStore};

    struct NullSink;

    #[async_trait]
    impl WatchSink for NullSink {
        async fn session_exists(&self, _session: &str) -> Result<bool> {
            Ok(true)
        }
        async fn observe(&self, _: &str, _: &str, _: &str, _: ResourceBundleStatus) {}
    }

    struct Stub {
        backend: String,
        cluster: String,
        ctx: BackendContext,
        reachable: bool,
    }

    #[async_trait]
    impl ClientProvider for Stub {
        fn backend_type(&self) -> &str {
            &self.backend
        }
        fn session(&self) -> &str {
            &self.ctx.session
        }
        fn cluster(&self) -> &str {
            &self.cluster
        }
        fn identity_scope(&self) -> IdentityScope {
            IdentityScope::Cluster
        }
        fn new_accumulator(&self, _op: OpKind) -> Result<Accumulator> {
            Ok(Accumulator::GitOps(Default::default()))
        }
        async fn create(&self, acc: Accumulator, _: &str, _: &StagedResource) -> Result<Accumulator> {
            Ok(acc)
        }
        async fn apply(&self, acc: Accumulator, _: &str, _: &StagedResource) -> Result<Accumulator> {
            Ok(acc)
        }
        async fn delete(&self, acc: Accumulator, _: &str, _: &StagedResource) -> Result<Accumulator> {
            Ok(acc)
        }
        async fn commit(&self, _: &str, _: Accumulator) -> Result<CommitReport> {
            Ok(CommitReport::default())
        }
        async fn get(&self, _: &str, _: &StagedResource) -> Result<Option<Value>> {
            Ok(None)
        }
        async fn is_reachable(&self) -> Result<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(Error::backend(self.ctx.cluster.to_string(), &self.backend, "connection refused"))
            }
        }
        async fn start_cluster_watcher(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn apply_status_cr(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_status_cr(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    struct StubFactory {
        backend: &'static str,
        reachable: bool,
        builds: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackendFactory for StubFactory {
        async fn build(&self, ctx: BackendContext) -> Result<Arc<dyn ClientProvider>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Arc::new(Stub {
                backend: self.backend.to_string(),
                cluster: ctx.cluster.to_string(),
                ctx,
                reachable: self.reachable,
            }))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        connector: Connector,
        credentials: CredentialStore,
        builds: Arc<AtomicUsize>,
    }

    fn fixture(reachable: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let credentials = CredentialStore::new(Arc::new(MemoryStore::new()));
        let builds = Arc::new(AtomicUsize::new(0));
        let mut registry = BackendRegistry::new();
        for backend in ["k8s", "github"] {
            registry.register(
                backend,
                Arc::new(StubFactory {
                    backend,
                    reachable,
                    builds: builds.clone(),
                }),
            );
        }
        let settings = ConnectorSettings {
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let connector = Connector::new(
            credentials.clone(),
            Arc::new(registry),
            Arc::new(NullSink),
            settings,
        );
        Fixture {
            _dir: dir,
            connector,
            credentials,
            builds,
        }
    }

    async fn register_kubeconfig(credentials: &CredentialStore) {
        credentials
            .create(CloudConfig {
                provider: "aws".to_string(),
                cluster: "edge".to_string(),
                level: "0".to_string(),
                namespace: "default".to_string(),
                config: "YXBpVmVyc2lvbjogdjE=".to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_cluster_name_fails_before_any_lookup() {
        let f = fixture(true);
        let cache = f.connector.cache("s1").await;
        let err = cache.get_client("providerA", "0", "default").await.err().unwrap();
        assert!(matches!(err, Error::InvalidClusterName { .. }));
        assert!(err.is_configuration());
        assert_eq!(f.builds.load(Ordering::SeqCst), 0);
    }

    /// Story: direct credentials are materialized under session/cluster and the client is cached
    #[tokio::test]
    async fn direct_credentials_are_materialized_and_cached() {
        let f = fixture(true);
        register_kubeconfig(&f.credentials).await;
        let cache = f.connector.cache("s1").await;

        let client = cache.get_client("aws+edge", "0", "default").await.unwrap();
        assert_eq!(client.backend_type(), "k8s");
        let kubeconfig = cache.work_dir().join("aws+edge").join(KUBECONFIG_FILE);
        assert_eq!(std::fs::read_to_string(kubeconfig).unwrap(), "apiVersion: v1");

        cache.get_client("aws+edge", "0", "default").await.unwrap();
        assert_eq!(f.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_lookups_build_once() {
        let f = fixture(true);
        register_kubeconfig(&f.credentials).await;
        let cache = f.connector.cache("s1").await;

        let (a, b) = tokio::join!(
            cache.get_client("aws+edge", "0", "default"),
            cache.get_client("aws+edge", "0", "default"),
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(f.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_credentials_fall_back_to_the_gitops_descriptor() {
        let f = fixture(true);
        f.credentials
            .put_gitops(
                "azure",
                "edge",
                &GitOpsDescriptor {
                    provider_type: "github".to_string(),
                    properties: Default::default(),
                },
            )
            .await
            .unwrap();
        let cache = f.connector.cache("s1").await;
        let client = cache.get_client("azure+edge", "0", "default").await.unwrap();
        assert_eq!(client.backend_type(), "github");
    }

    #[tokio::test]
    async fn unknown_descriptor_type_is_a_configuration_error() {
        let f = fixture(true);
        for (cluster, provider_type) in [("a", "gitlab"), ("b", "")] {
            f.credentials
                .put_gitops(
                    "azure",
                    cluster,
                    &GitOpsDescriptor {
                        provider_type: provider_type.to_string(),
                        properties: Default::default(),
                    },
                )
                .await
                .unwrap();
        }
        let cache = f.connector.cache("s1").await;
        for cluster in ["azure+a", "azure+b"] {
            let err = cache.get_client(cluster, "0", "default").await.err().unwrap();
            assert!(err.is_configuration(), "{cluster}");
        }
    }

    #[tokio::test]
    async fn no_credentials_at_all_is_not_found() {
        let f = fixture(true);
        let cache = f.connector.cache("s1").await;
        let err = cache.get_client("aws+nowhere", "0", "default").await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn failed_probe_is_cluster_unreachable() {
        let f = fixture(false);
        register_kubeconfig(&f.credentials).await;
        let cache = f.connector.cache("s1").await;
        let err = cache
            .get_client_with_retry("aws+edge", "0", "default")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ClusterUnreachable { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn release_removes_the_session_directory_and_cancels() {
        let f = fixture(true);
        register_kubeconfig(&f.credentials).await;
        let cache = f.connector.cache("s1").await;
        cache.get_client("aws+edge", "0", "default").await.unwrap();
        let token = cache.cancellation();
        assert!(cache.work_dir().exists());

        f.connector.release("s1").await;
        assert!(!cache.work_dir().exists());
        assert!(token.is_cancelled());

        let fresh = f.connector.cache("s1").await;
        assert!(!Arc::ptr_eq(&cache, &fresh));
    }

    /// Story: an operator moves the cluster credentials to another namespace
    #[tokio::test]
    async fn moved_cluster_credentials_are_still_found() {
        let f = fixture(true);
        register_kubeconfig(&f.credentials).await;
        f.credentials
            .set_namespace("aws", "edge", "tenant-a")
            .await
            .unwrap();
        let cache = f.connector.cache("s1").await;

        let client = cache.get_client("aws+edge", "0", "default").await.unwrap();
        assert_eq!(client.backend_type(), "k8s");
        assert!(cache.has_client("aws+edge").await);
        let kubeconfig = cache.work_dir().join("aws+edge").join(KUBECONFIG_FILE);
        assert_eq!(
            tokio::fs::read_to_string(kubeconfig).await.unwrap(),
            "apiVersion: v1"
        );
    }

    #[tokio::test]
    async fn other_levels_do_not_search_namespaces() {
        let f = fixture(true);
        register_kubeconfig(&f.credentials).await;
        f.credentials
            .set_namespace("aws", "edge", "tenant-a")
            .await
            .unwrap();
        let cache = f.connector.cache("s1").await;
        let err = cache.get_client("aws+edge", "1", "default").await.err().unwrap();
        assert!(err.is_not_found());
        assert!(!cache.has_client("aws+edge").await);
    }

    #[tokio::test]
    async fn remove_client_forces_a_rebuild() {
        let f = fixture(true);
        register_kubeconfig(&f.credentials).await;
        let cache = f.connector.cache("s1").await;
        cache.get_client("aws+edge", "0", "default").await.unwrap();
        assert!(cache.remove_client("aws+edge").await);
        assert!(!cache.remove_client("aws+edge").await);
        cache.get_client("aws+edge", "0", "default").await.unwrap();
        assert_eq!(f.builds.load(Ordering::SeqCst), 2);
    }
}
