//! ---
//! ha_section: "03-persistence-logging"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Metrics collection and export utilities."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Bind `addr` and serve the registry at `/metrics`.
pub async fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    let addr = listener
        .local_addr()
        .context("failed to read metrics listener address")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the coordination daemon.
#[derive(Clone, Debug)]
pub struct CoordinatorMetrics {
    registry: SharedRegistry,
    role: IntGauge,
    hosts_known: IntGauge,
    hosts_marked_offline: IntCounter,
    state_pushes: IntCounterVec,
    backup_pull_failures: IntCounterVec,
    ipc_messages: IntCounterVec,
}

impl CoordinatorMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let role = IntGauge::with_opts(Opts::new(
            "hoster_ha_role",
            "Local role of this node (1 master, 0 backup)",
        ))?;
        registry.register(Box::new(role.clone()))?;

        let hosts_known = IntGauge::with_opts(Opts::new(
            "hoster_ha_hosts_known",
            "Number of host records in the fleet registry",
        ))?;
        registry.register(Box::new(hosts_known.clone()))?;

        let hosts_marked_offline = IntCounter::with_opts(Opts::new(
            "hoster_ha_hosts_marked_offline_total",
            "Hosts flagged offline by the failure detector",
        ))?;
        registry.register(Box::new(hosts_marked_offline.clone()))?;

        let state_pushes = IntCounterVec::new(
            Opts::new(
                "hoster_ha_state_pushes_total",
                "State pushes to peers by outcome",
            ),
            &["peer", "outcome"],
        )?;
        registry.register(Box::new(state_pushes.clone()))?;

        let backup_pull_failures = IntCounterVec::new(
            Opts::new(
                "hoster_ha_backup_pull_failures_total",
                "Failed backup inventory pulls by peer",
            ),
            &["peer"],
        )?;
        registry.register(Box::new(backup_pull_failures.clone()))?;

        let ipc_messages = IntCounterVec::new(
            Opts::new(
                "hoster_ha_ipc_messages_total",
                "IPC messages received by discriminant",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(ipc_messages.clone()))?;

        Ok(Self {
            registry,
            role,
            hosts_known,
            hosts_marked_offline,
            state_pushes,
            backup_pull_failures,
            ipc_messages,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_master(&self, is_master: bool) {
        self.role.set(if is_master { 1 } else { 0 });
    }

    pub fn set_hosts_known(&self, count: usize) {
        self.hosts_known.set(count as i64);
    }

    pub fn add_hosts_marked_offline(&self, count: usize) {
        self.hosts_marked_offline.inc_by(count as u64);
    }

    pub fn record_push(&self, peer: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "failed" };
        self.state_pushes.with_label_values(&[peer, outcome]).inc();
    }

    pub fn record_pull_failure(&self, peer: &str) {
        self.backup_pull_failures.with_label_values(&[peer]).inc();
    }

    pub fn record_ipc_message(&self, kind: &str) {
        self.ipc_messages.with_label_values(&[kind]).inc();
    }
}

/// Metrics recorded by the liveness watchdog.
#[derive(Clone, Debug)]
pub struct WatchdogMetrics {
    registry: SharedRegistry,
    missed_checks: IntCounter,
    fencing_events: IntCounter,
    state: IntGaugeVec,
}

impl WatchdogMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let missed_checks = IntCounter::with_opts(Opts::new(
            "hoster_ha_watchdog_missed_checks_total",
            "Checks that found no recent liveness pulse",
        ))?;
        registry.register(Box::new(missed_checks.clone()))?;

        let fencing_events = IntCounter::with_opts(Opts::new(
            "hoster_ha_watchdog_fencing_total",
            "Number of times the watchdog entered fencing",
        ))?;
        registry.register(Box::new(fencing_events.clone()))?;

        let state = IntGaugeVec::new(
            Opts::new(
                "hoster_ha_watchdog_state",
                "Indicator (0/1) of the current watchdog state",
            ),
            &["state"],
        )?;
        registry.register(Box::new(state.clone()))?;

        Ok(Self {
            registry,
            missed_checks,
            fencing_events,
            state,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_missed(&self) {
        self.missed_checks.inc();
    }

    pub fn inc_fencing(&self) {
        self.fencing_events.inc();
    }

    /// Set `current` to 1 and every other known state label to 0.
    pub fn set_state(&self, current: &str, all: &[&str]) {
        for label in all {
            let value = if *label == current { 1 } else { 0 };
            self.state.with_label_values(&[label]).set(value);
        }
    }
}

pub use prometheus;
