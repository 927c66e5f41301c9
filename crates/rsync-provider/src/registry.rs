//! Backend registry
//!
//! Maps a backend type string to the factory that builds providers of that
//! type. Adding a backend is one `register` call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use rsync_common::{Error, Result};

use crate::fleet::{FleetFactory, FLEET_BACKEND};
use crate::gitops::azurearc::{AzureArcFactory, AZURE_ARC_BACKEND};
use crate::gitops::github::{GitHubFactory, GITHUB_BACKEND};
use crate::k8s::{KubeFactory, BATCH_BACKEND, DIRECT_BACKEND};
use crate::provider::{BackendContext, ClientProvider};

/// Builds a provider for one session and cluster
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Build a provider from resolved credentials
    async fn build(&self, ctx: BackendContext) -> Result<Arc<dyn ClientProvider>>;
}

/// Backend type → factory
#[derive(Default, Clone)]
pub struct BackendRegistry {
    factories: HashMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in backend
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DIRECT_BACKEND, Arc::new(KubeFactory::direct()));
        registry.register(BATCH_BACKEND, Arc::new(KubeFactory::batched()));
        registry.register(GITHUB_BACKEND, Arc::new(GitHubFactory));
        registry.register(AZURE_ARC_BACKEND, Arc::new(AzureArcFactory));
        registry.register(FLEET_BACKEND, Arc::new(FleetFactory));
        registry
    }

    /// Register (or replace) the factory for `backend`
    pub fn register(&mut self, backend: impl Into<String>, factory: Arc<dyn BackendFactory>) {
        self.factories.insert(backend.into(), factory);
    }

    /// Registered backend types, sorted
    pub fn backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Factory for `backend`; unknown or empty types are configuration errors
    pub fn get(&self, backend: &str) -> Result<Arc<dyn BackendFactory>> {
        if backend.is_empty() {
            return Err(Error::configuration("backend registry", "empty backend type"));
        }
        self.factories.get(backend).cloned().ok_or_else(|| {
            Error::configuration(
                "backend registry",
                format!("unsupported backend type '{backend}'"),
            )
        })
    }

    /// Build a provider of type `backend`
    pub async fn build(&self, backend: &str, ctx: BackendContext) -> Result<Arc<dyn ClientProvider>> {
        let factory = self.get(backend)?;
        debug!(backend = %backend, session = %ctx.session, cluster = %ctx.cluster, "building provider");
        factory.build(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitops::tests::gitops_context;

    struct Refusing;

    #[async_trait]
    impl BackendFactory for Refusing {
        async fn build(&self, ctx: BackendContext) -> Result<Arc<dyn ClientProvider>> {
            Err(Error::internal_with_context("refusing", ctx.session))
        }
    }

    #[test]
    fn defaults_cover_every_builtin_backend() {
        assert_eq!(
            BackendRegistry::with_defaults().backends(),
            vec!["azureArcV2", "fleet", "github", "k8s", "k8s-batch"]
        );
    }

    #[test]
    fn unknown_and_empty_types_are_configuration_errors() {
        let registry = BackendRegistry::with_defaults();
        for backend in ["", "gitlab"] {
            let err = registry.get(backend).err().unwrap();
            assert!(err.is_configuration(), "{backend}");
            assert!(!err.is_retryable());
        }
    }

    #[tokio::test]
    async fn build_dispatches_to_the_registered_factory() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = BackendRegistry::new();
        registry.register("custom", Arc::new(Refusing));
        let err = registry
            .build("custom", gitops_context(dir.path(), "custom"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("refusing"));
    }
}
