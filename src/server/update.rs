//! `UpdateApp` service: move a deployment between sessions

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{error, info, instrument};

use rsync_lifecycle::Engine;
use rsync_proto::{
    RollbackAppRequest, RollbackAppResponse, UpdateApp, UpdateAppRequest, UpdateAppResponse,
    UpdateAppServer,
};

use super::require_id;

/// Serves `UpdateApp` and `RollbackApp`
pub struct UpdateService {
    engine: Arc<Engine>,
}

impl UpdateService {
    /// Service driving `engine`
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Convert to a tonic service
    pub fn into_service(self) -> UpdateAppServer<Self> {
        UpdateAppServer::new(self)
    }
}

#[tonic::async_trait]
impl UpdateApp for UpdateService {
    #[instrument(skip(self, request))]
    async fn update_app(
        &self,
        request: Request<UpdateAppRequest>,
    ) -> Result<Response<UpdateAppResponse>, Status> {
        let req = request.into_inner();
        let from = require_id("update_from_app_context_id", req.update_from_app_context_id)?;
        let to = require_id("update_to_app_context_id", req.update_to_app_context_id)?;

        let response = match self.engine.update(&from, &to).await {
            Ok(()) => {
                info!(from = %from, to = %to, "app context updated");
                UpdateAppResponse {
                    app_context_updated: true,
                    app_context_update_message: format!("updated app context {from} to {to}"),
                }
            }
            Err(e) => {
                error!(from = %from, to = %to, error = %e, "update failed");
                UpdateAppResponse {
                    app_context_updated: false,
                    app_context_update_message: format!("update of app context {from} to {to} failed: {e}"),
                }
            }
        };
        Ok(Response::new(response))
    }

    #[instrument(skip(self, request))]
    async fn rollback_app(
        &self,
        request: Request<RollbackAppRequest>,
    ) -> Result<Response<RollbackAppResponse>, Status> {
        let req = request.into_inner();
        let from = require_id("rollback_from_app_context_id", req.rollback_from_app_context_id)?;
        let to = require_id("rollback_to_app_context_id", req.rollback_to_app_context_id)?;

        let response = match self.engine.rollback(&from, &to).await {
            Ok(()) => {
                info!(from = %from, to = %to, "app context rolled back");
                RollbackAppResponse {
                    app_context_rolledback: true,
                    app_context_rollback_message: format!("rolled back app context {from} to {to}"),
                }
            }
            Err(e) => {
                error!(from = %from, to = %to, error = %e, "rollback failed");
                RollbackAppResponse {
                    app_context_rolledback: false,
                    app_context_rollback_message: format!("rollback of app context {from} to {to} failed: {e}"),
                }
            }
        };
        Ok(Response::new(response))
    }
}
