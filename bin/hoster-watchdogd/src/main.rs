//! ---
//! ha_section: "07-resilience-fault-tolerance"
//! ha_subsection: "binary"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Binary entrypoint for the liveness watchdog."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hoster_ha_common::config::{AppConfig, WatchdogConfig, DEFAULT_CONFIG_PATH};
use hoster_ha_common::logging::{flush_logs, init_tracing};
use hoster_ha_metrics::{new_registry, spawn_http_server, WatchdogMetrics};
use hoster_ha_watchdog::{
    run_watchdog, CommandAction, SignalPulseSource, Watchdog, WatchdogActions, WatchdogExit,
};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Hoster HA liveness watchdog",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Fence but never reboot; for operational testing only")]
    debug: bool,
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
    init_tracing("hoster-watchdogd", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    let debug = cli.debug || config.watchdog.debug_requested();
    if debug {
        warn!(
            env = WatchdogConfig::ENV_DEBUG,
            "##### WATCHDOG DEBUG MODE ENABLED: host will NOT be rebooted on liveness loss #####"
        );
    }

    let exit = supervise(&config, debug).await?;
    info!(?exit, code = exit.exit_code(), "watchdog finished");
    if exit.exit_code() != 0 {
        flush_logs();
        std::process::exit(exit.exit_code());
    }
    Ok(())
}

async fn supervise(config: &AppConfig, debug: bool) -> Result<WatchdogExit> {
    let settings = &config.watchdog;
    let source = SignalPulseSource::install_and_announce(settings.pid_file.as_deref())
        .context("failed to arm liveness signal handling")?;

    let (metrics, metrics_server) = if config.metrics.enabled {
        let shared = new_registry();
        let metrics = WatchdogMetrics::new(shared.clone())?;
        let server = spawn_http_server(shared, config.metrics.watchdog_listen).await?;
        (Some(metrics), Some(server))
    } else {
        (None, None)
    };

    let actions = WatchdogActions {
        fencer: Arc::new(CommandAction::new(settings.fence_command.clone())),
        rebooter: Arc::new(CommandAction::new(settings.reboot_command.clone())),
        debug,
        metrics,
    };
    info!(
        interval_secs = settings.check_interval.as_secs(),
        threshold = settings.missed_threshold,
        pid = std::process::id(),
        "watchdog armed; waiting for SIGHUP pulses"
    );
    let exit = run_watchdog(Watchdog::from_config(settings, Instant::now()), source, actions).await;

    if let Some(server) = metrics_server {
        if let Err(err) = server.shutdown().await {
            warn!(error = %err, "metrics server shutdown failed");
        }
    }
    if let Some(path) = &settings.pid_file {
        if let Err(err) = std::fs::remove_file(path) {
            warn!(error = %err, path = %path.display(), "failed to remove pid file");
        }
    }
    Ok(exit)
}
