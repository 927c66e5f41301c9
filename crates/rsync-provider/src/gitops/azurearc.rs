//! Azure Arc git-ops
//!
//! Same repository layout as GitHub. Instead of committing Flux objects,
//! the sync configuration is created on the Arc-connected cluster through
//! Azure Resource Manager as a Flux configuration extension resource.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use rsync_common::crd::status_cr_name;
use rsync_common::{Error, Result};
use rsync_store::GitOpsDescriptor;

use super::{app_dir, GitOpsCore, GitOpsProvider, SyncConfig};
use crate::provider::{BackendContext, ClientProvider};
use crate::registry::BackendFactory;

/// Backend type of Azure Arc git-ops
pub const AZURE_ARC_BACKEND: &str = "azureArcV2";

const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const MANAGEMENT_BASE: &str = "https://management.azure.com";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
const API_VERSION: &str = "2022-03-01";
const SYNC_SECONDS: u64 = 60;
const TIMEOUT_SECONDS: u64 = 600;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Descriptor fields of an Arc-connected cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArcSettings {
    /// Repository URL
    pub url: String,
    /// Repository branch
    pub branch: String,
    /// Repository user
    pub user: String,
    /// Repository token
    pub token: String,
    /// Service principal
    pub client_id: String,
    /// Service principal secret
    pub client_secret: String,
    /// Azure AD tenant
    pub tenant_id: String,
    /// Subscription of the connected cluster
    pub subscription_id: String,
    /// Resource group of the connected cluster
    pub resource_group: String,
    /// Connected cluster name
    pub arc_cluster: String,
}

impl ArcSettings {
    /// Read every required field; any missing field is a configuration error
    pub fn from_descriptor(d: &GitOpsDescriptor) -> Result<Self> {
        Ok(Self {
            url: d.property("url")?.to_string(),
            branch: d.property("branch")?.to_string(),
            user: d.property("userName")?.to_string(),
            token: d.property("token")?.to_string(),
            client_id: d.property("clientId")?.to_string(),
            client_secret: d.property("clientSecret")?.to_string(),
            tenant_id: d.property("tenantId")?.to_string(),
            subscription_id: d.property("subscriptionId")?.to_string(),
            resource_group: d.property("arcResourceGroup")?.to_string(),
            arc_cluster: d.property("arcCluster")?.to_string(),
        })
    }

    /// Token endpoint of the tenant
    pub fn token_url(&self) -> String {
        format!("{LOGIN_BASE}/{}/oauth2/v2.0/token", self.tenant_id)
    }

    /// ARM URL of one Flux configuration
    pub fn flux_configuration_url(&self, name: &str) -> String {
        format!(
            "{MANAGEMENT_BASE}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Kubernetes/connectedClusters/{}/providers/Microsoft.KubernetesConfiguration/fluxConfigurations/{name}?api-version={API_VERSION}",
            self.subscription_id, self.resource_group, self.arc_cluster
        )
    }

    /// Flux configuration syncing `path` of the repository
    pub fn flux_configuration_body(&self, name: &str, path: &str) -> Value {
        let key = base64::engine::general_purpose::STANDARD.encode(&self.token);
        json!({
            "properties": {
                "scope": "cluster",
                "namespace": "flux-system",
                "sourceKind": "GitRepository",
                "suspend": false,
                "gitRepository": {
                    "url": self.url,
                    "timeoutInSeconds": TIMEOUT_SECONDS,
                    "syncIntervalInSeconds": SYNC_SECONDS,
                    "repositoryRef": { "branch": self.branch },
                    "httpsUser": self.user,
                },
                "configurationProtectedSettings": { "httpsKey": key },
                "kustomizations": {
                    name: {
                        "path": path,
                        "timeoutInSeconds": TIMEOUT_SECONDS,
                        "syncIntervalInSeconds": SYNC_SECONDS,
                        "prune": true,
                    }
                },
            }
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Creates Flux configurations through Azure Resource Manager
pub struct ArcFluxConfig {
    settings: ArcSettings,
    http: reqwest::Client,
    cluster: String,
}

impl ArcFluxConfig {
    /// Client for one connected cluster
    pub fn new(settings: ArcSettings, cluster: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context("azure arc", e.to_string()))?;
        Ok(Self {
            settings,
            http,
            cluster: cluster.to_string(),
        })
    }

    fn error(&self, e: reqwest::Error) -> Error {
        Error::backend(&self.cluster, AZURE_ARC_BACKEND, e.to_string())
    }

    async fn access_token(&self) -> Result<String> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("scope", MANAGEMENT_SCOPE),
        ];
        let response = self
            .http
            .post(self.settings.token_url())
            .form(&form)
            .send()
            .await
            .map_err(|e| self.error(e))?;
        let response = self.check(response).await?;
        let token: TokenResponse = response.json().await.map_err(|e| self.error(e))?;
        Ok(token.access_token)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let msg = format!("{status}: {body}");
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(Error::backend_permanent(&self.cluster, AZURE_ARC_BACKEND, msg))
        } else {
            Err(Error::backend(&self.cluster, AZURE_ARC_BACKEND, msg))
        }
    }
}

#[async_trait]
impl SyncConfig for ArcFluxConfig {
    async fn apply(&self, core: &GitOpsCore, app: &str) -> Result<()> {
        let name = status_cr_name(core.session(), app);
        let body = self
            .settings
            .flux_configuration_body(&name, &app_dir(core.cluster_dir(), core.session(), app));
        let token = self.access_token().await?;
        let response = self
            .http
            .put(self.settings.flux_configuration_url(&name))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.error(e))?;
        self.check(response).await?;
        info!(cluster = %self.cluster, configuration = %name, "arc flux configuration applied");
        Ok(())
    }

    async fn delete(&self, core: &GitOpsCore, app: &str) -> Result<()> {
        let name = status_cr_name(core.session(), app);
        let token = self.access_token().await?;
        let response = self
            .http
            .delete(self.settings.flux_configuration_url(&name))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.error(e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(configuration = %name, "arc flux configuration already gone");
            return Ok(());
        }
        self.check(response).await?;
        Ok(())
    }
}

/// Builds Azure Arc git-ops providers from descriptors
pub struct AzureArcFactory;

#[async_trait]
impl BackendFactory for AzureArcFactory {
    async fn build(&self, ctx: BackendContext) -> Result<Arc<dyn ClientProvider>> {
        let settings = ArcSettings::from_descriptor(ctx.descriptor(AZURE_ARC_BACKEND)?)?;
        let config = ArcFluxConfig::new(settings, &ctx.cluster.to_string())?;
        let core = GitOpsCore::new(&ctx, AZURE_ARC_BACKEND)?;
        Ok(Arc::new(GitOpsProvider::new(core, Box::new(config))))
    }
}
