//! `InstallApp` service: instantiate and terminate sessions

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{error, info, instrument};

use rsync_lifecycle::Engine;
use rsync_proto::{
    InstallApp, InstallAppRequest, InstallAppResponse, InstallAppServer, UninstallAppRequest,
    UninstallAppResponse,
};

use super::require_id;

/// Serves `InstallApp` and `UninstallApp`
pub struct InstallService {
    engine: Arc<Engine>,
}

impl InstallService {
    /// Service driving `engine`
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Convert to a tonic service
    pub fn into_service(self) -> InstallAppServer<Self> {
        InstallAppServer::new(self)
    }
}

#[tonic::async_trait]
impl InstallApp for InstallService {
    #[instrument(skip(self, request), fields(session))]
    async fn install_app(
        &self,
        request: Request<InstallAppRequest>,
    ) -> Result<Response<InstallAppResponse>, Status> {
        let id = require_id("app_context_id", request.into_inner().app_context_id)?;
        tracing::Span::current().record("session", id.as_str());

        let response = match self.engine.install(&id).await {
            Ok(()) => {
                info!(session = %id, "app context installed");
                InstallAppResponse {
                    app_context_installed: true,
                    app_context_install_message: format!("installed app context {id}"),
                }
            }
            Err(e) => {
                error!(session = %id, error = %e, "install failed");
                InstallAppResponse {
                    app_context_installed: false,
                    app_context_install_message: format!("instantiate of app context {id} failed: {e}"),
                }
            }
        };
        Ok(Response::new(response))
    }

    #[instrument(skip(self, request), fields(session))]
    async fn uninstall_app(
        &self,
        request: Request<UninstallAppRequest>,
    ) -> Result<Response<UninstallAppResponse>, Status> {
        let id = require_id("app_context_id", request.into_inner().app_context_id)?;
        tracing::Span::current().record("session", id.as_str());

        let response = match self.engine.terminate(&id).await {
            Ok(()) => {
                info!(session = %id, "app context uninstalled");
                UninstallAppResponse {
                    app_context_uninstalled: true,
                    app_context_uninstall_message: format!("uninstalled app context {id}"),
                }
            }
            Err(e) => {
                error!(session = %id, error = %e, "uninstall failed");
                UninstallAppResponse {
                    app_context_uninstalled: false,
                    app_context_uninstall_message: format!("terminate of app context {id} failed: {e}"),
                }
            }
        };
        Ok(Response::new(response))
    }
}
