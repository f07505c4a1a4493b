//! ---
//! ha_section: "01-core-functionality"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Periodic task set and lifecycle management."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use hoster_ha_metrics::CoordinatorMetrics;
use hoster_ha_net::IpcListener;
use hoster_ha_redundancy::RoleMonitor;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::coordinator::HaCoordinator;

/// Owns the role monitor and coordinator until [`HaRuntime::start`] spawns them.
pub struct HaRuntime {
    monitor: RoleMonitor,
    coordinator: Arc<HaCoordinator>,
    poll_interval: Duration,
    ipc: Option<IpcListener>,
    metrics: Option<CoordinatorMetrics>,
}

impl HaRuntime {
    /// `coordinator` must read its role from `monitor.subscribe()`.
    pub fn new(monitor: RoleMonitor, coordinator: Arc<HaCoordinator>, poll_interval: Duration) -> Self {
        Self {
            monitor,
            coordinator,
            poll_interval,
            ipc: None,
            metrics: None,
        }
    }

    pub fn with_ipc(mut self, listener: IpcListener) -> Self {
        self.ipc = Some(listener);
        self
    }

    pub fn with_metrics(mut self, metrics: CoordinatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn coordinator(&self) -> Arc<HaCoordinator> {
        self.coordinator.clone()
    }

    /// Spawn the role, ping, sync, aggregation, detection and IPC tasks.
    pub fn start(self) -> HaRuntimeHandle {
        let (shutdown_tx, _) = broadcast::channel(4);
        let mut tasks = Vec::new();
        let period = self.poll_interval;

        let monitor = Arc::new(self.monitor);
        let role_monitor = monitor.clone();
        let metrics = self.metrics.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tasks.push((
            "role",
            tokio::spawn(async move {
                let mut ticker = ticker(period);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = ticker.tick() => {
                            let role = role_monitor.determine_role(Utc::now()).await;
                            if let Some(metrics) = &metrics {
                                metrics.set_master(role.is_master());
                            }
                        }
                    }
                }
                debug!("role task stopped");
            }),
        ));

        // Probes run sequentially and may each take a full request timeout, so
        // they stay off the role task to keep its cadence fixed.
        let coordinator = self.coordinator.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tasks.push((
            "ping",
            tokio::spawn(async move {
                let mut ticker = ticker(period);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = ticker.tick() => {
                            if !coordinator.role().is_master() {
                                if let Some(master) = coordinator.ping_master().await {
                                    monitor.record_master(&master);
                                }
                            }
                        }
                    }
                }
                debug!("ping task stopped");
            }),
        ));

        let coordinator = self.coordinator.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tasks.push((
            "sync",
            tokio::spawn(async move {
                let mut ticker = ticker(period);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = ticker.tick() => {
                            coordinator.sync_state().await;
                        }
                    }
                }
                debug!("sync task stopped");
            }),
        ));

        let coordinator = self.coordinator.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tasks.push((
            "aggregate",
            tokio::spawn(async move {
                let mut ticker = ticker(period);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = ticker.tick() => {
                            coordinator.refresh_remote_backups().await;
                        }
                    }
                }
                debug!("aggregate task stopped");
            }),
        ));

        let coordinator = self.coordinator.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tasks.push((
            "detect",
            tokio::spawn(async move {
                let mut ticker = ticker(period);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = ticker.tick() => {
                            coordinator.detect_offline_hosts(Utc::now());
                        }
                    }
                }
                debug!("detect task stopped");
            }),
        ));

        if let Some(listener) = self.ipc {
            tasks.push(("ipc", tokio::spawn(listener.serve(shutdown_tx.subscribe()))));
        }

        info!(
            hostname = %self.coordinator.hostname(),
            poll_secs = period.as_secs_f64(),
            "ha runtime started"
        );
        HaRuntimeHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Lifecycle handle for a started [`HaRuntime`].
#[derive(Debug)]
pub struct HaRuntimeHandle {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl HaRuntimeHandle {
    /// Signal every task to stop and wait for all of them.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for (name, task) in self.tasks {
            if let Err(err) = task.await {
                error!(task = name, error = %err, "runtime task join error");
            }
        }
        info!("ha runtime shutdown complete");
        Ok(())
    }
}
