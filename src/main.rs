//! rsync daemon - deploys composite applications across clusters

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rsync::server;
use rsync::{Engine, EngineSettings};
use rsync_common::discovery::{resolve_service_endpoint, ProcessEnv};
use rsync_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use rsync_connector::ConnectorSettings;
use rsync_depend::DependencySettings;
use rsync_provider::{BackendRegistry, ProviderSettings};
use rsync_store::{FileStore, KvStore, MemoryStore, Seed};

/// rsync - resource synchronization engine
#[derive(Parser, Debug)]
#[command(name = "rsync", version, about, long_about = None)]
struct Cli {
    /// Root of per-session working directories
    #[arg(long, env = "RSYNC_WORK_DIR", default_value = "/tmp/rsync")]
    work_dir: PathBuf,

    /// Backend serving clusters with direct credentials
    #[arg(
        long,
        env = "RSYNC_DIRECT_BACKEND",
        default_value = "k8s",
        value_parser = ["k8s", "k8s-batch"]
    )]
    direct_backend: String,

    /// Delay before the first resource dependency check, in seconds
    #[arg(long, env = "RSYNC_RESOURCE_FIRST_CHECK_SECS", default_value = "1")]
    resource_first_check_secs: u64,

    /// Interval between resource dependency checks, in seconds
    #[arg(long, env = "RSYNC_RESOURCE_POLL_SECS", default_value = "30")]
    resource_poll_secs: u64,

    /// Interval between git-ops status file polls, in seconds
    #[arg(long, env = "RSYNC_STATUS_POLL_SECS", default_value = "60")]
    status_poll_secs: u64,

    /// Author name of git-ops commits
    #[arg(long, env = "RSYNC_GIT_AUTHOR", default_value = "rsync")]
    git_author: String,

    /// Author email of git-ops commits
    #[arg(long, env = "RSYNC_GIT_EMAIL", default_value = "rsync@localhost")]
    git_email: String,

    /// Log line encoding (json or text)
    #[arg(long, env = "RSYNC_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// JSON file persisting credentials and sessions; in-memory when unset
    #[arg(long, env = "RSYNC_STORE_FILE")]
    store_file: Option<PathBuf>,

    /// YAML file of credentials, git-ops descriptors and sessions to register at startup
    #[arg(long, env = "RSYNC_SEED_FILE")]
    seed_file: Option<PathBuf>,

    /// OTLP gRPC endpoint for trace export
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            connector: ConnectorSettings {
                work_dir: self.work_dir.clone(),
                direct_backend: self.direct_backend.clone(),
                provider: ProviderSettings {
                    status_poll_interval: Duration::from_secs(self.status_poll_secs),
                    git_author: self.git_author.clone(),
                    git_email: self.git_email.clone(),
                    ..Default::default()
                },
            },
            dependency: DependencySettings {
                resource_first_check: Duration::from_secs(self.resource_first_check_secs),
                resource_poll: Duration::from_secs(self.resource_poll_secs),
            },
            ..Default::default()
        }
    }
}

async fn open_store(cli: &Cli) -> anyhow::Result<Arc<dyn KvStore>> {
    Ok(match &cli.store_file {
        Some(path) => Arc::new(
            FileStore::open(path)
                .await
                .map_err(|e| anyhow::anyhow!("failed to open store file: {e}"))?,
        ),
        None => Arc::new(MemoryStore::new()),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install the rustls crypto provider");
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        otlp_endpoint: cli.otlp_endpoint.clone(),
        format: cli.log_format,
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {e}"))?;

    let endpoint = resolve_service_endpoint(&ProcessEnv);
    let addr = SocketAddr::from(([0, 0, 0, 0], endpoint.port));
    info!(service = %endpoint, work_dir = %cli.work_dir.display(), backend = %cli.direct_backend, "starting rsync");

    let engine = Arc::new(Engine::new(
        open_store(&cli).await?,
        BackendRegistry::with_defaults(),
        cli.engine_settings(),
    ));

    if let Some(path) = &cli.seed_file {
        let seed = Seed::read(path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read seed file: {e}"))?;
        let report = seed
            .apply(engine.credentials(), engine.sessions().as_ref())
            .await
            .map_err(|e| anyhow::anyhow!("failed to apply seed file: {e}"))?;
        info!(seed = %path.display(), loaded = report.loaded, skipped = report.skipped, "seed loaded");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                return;
            }
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    server::serve(engine, addr, shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("gRPC server failed: {e}"))
}
