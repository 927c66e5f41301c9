//! gRPC servers of the rsync daemon

mod install;
mod update;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::Status;
use tracing::info;

use rsync_lifecycle::Engine;

pub use install::InstallService;
pub use update::UpdateService;

/// Reject empty session ids before any work starts
pub(crate) fn require_id(field: &str, id: String) -> Result<String, Status> {
    let id = id.trim().to_string();
    if id.is_empty() {
        return Err(Status::invalid_argument(format!("{field} is required")));
    }
    Ok(id)
}

/// Serve both deployment services on `addr` until `shutdown` fires
pub async fn serve(
    engine: Arc<Engine>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    info!(%addr, "starting rsync gRPC server");
    Server::builder()
        .add_service(InstallService::new(engine.clone()).into_service())
        .add_service(UpdateService::new(engine).into_service())
        .serve_with_shutdown(addr, shutdown.cancelled_owned())
        .await
}
