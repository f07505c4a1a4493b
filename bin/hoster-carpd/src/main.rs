//! ---
//! ha_section: "01-core-functionality"
//! ha_subsection: "binary"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Binary entrypoint for the HA coordination daemon."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hoster_ha_common::config::{AppConfig, DEFAULT_CONFIG_PATH};
use hoster_ha_common::logging::init_tracing;
use hoster_ha_core::{HaCoordinator, HaRuntime};
use hoster_ha_metrics::{new_registry, spawn_http_server, CoordinatorMetrics};
use hoster_ha_net::{HttpPeerClient, IpcListener, PeerApiBuilder};
use hoster_ha_redundancy::{FailureDetector, FleetRegistry, IfconfigStatusSource, RoleMonitor};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Hoster HA coordination daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));
    candidates.push(PathBuf::from("configs/ha_config.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("hoster-carpd", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    let carp = &config.carp;
    let hostname = carp.effective_hostname();
    let registry = Arc::new(FleetRegistry::new());

    let (metrics, metrics_server) = if config.metrics.enabled {
        let shared = new_registry();
        let metrics = CoordinatorMetrics::new(shared.clone())?;
        let server = spawn_http_server(shared, config.metrics.listen).await?;
        (Some(metrics), Some(server))
    } else {
        info!("metrics exporter disabled by configuration");
        (None, None)
    };

    let monitor = RoleMonitor::new(
        hostname.clone(),
        Arc::new(IfconfigStatusSource::new(carp.carp_status_command.clone())),
    );
    let transport = Arc::new(
        HttpPeerClient::new(carp.peer_port, carp.request_timeout)
            .context("failed to build peer client")?,
    );
    let mut coordinator = HaCoordinator::new(
        hostname.clone(),
        registry.clone(),
        monitor.subscribe(),
        transport,
        FailureDetector::from_config(carp),
    )
    .with_advertise_address(carp.advertise_address.clone())
    .with_peers(carp.peers.clone());
    if let Some(metrics) = &metrics {
        coordinator = coordinator.with_metrics(metrics.clone());
    }
    if carp.advertise_address.is_empty() {
        warn!("carp.advertise_address is empty; the master cannot refresh this host from pings");
    }

    let mut ipc = IpcListener::bind(&carp.socket_path, registry.clone()).with_context(|| {
        format!("cannot bind ipc socket {}", carp.socket_path.display())
    })?;
    if let Some(metrics) = &metrics {
        ipc = ipc.with_metrics(metrics.clone());
    }

    let peer_api = PeerApiBuilder::new(carp.listen, hostname.clone(), registry, monitor.subscribe())
        .spawn()
        .await
        .with_context(|| format!("cannot bind peer endpoint {}", carp.listen))?;

    let mut runtime = HaRuntime::new(monitor, Arc::new(coordinator), carp.poll_interval).with_ipc(ipc);
    if let Some(metrics) = metrics {
        runtime = runtime.with_metrics(metrics);
    }
    let handle = runtime.start();

    info!(hostname = %hostname, peer_api = %peer_api.local_addr(), "daemon running; waiting for termination signal");
    shutdown_signal().await;
    info!("termination requested; shutting down");
    handle.shutdown().await?;
    peer_api.shutdown().await?;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = ctrl_c() => {},
        _ = terminate() => {},
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(err) => {
            warn!(?err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}
