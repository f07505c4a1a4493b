//! ---
//! ha_section: "05-networking-external-interfaces"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Peer HTTP endpoint receiving pushes, probes and pulls."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use hoster_ha_common::time::unix_now;
use hoster_ha_msg::{
    BackupRecord, PingRequest, PingResponse, SocketResponse, StatePush, StatusReport,
};
use hoster_ha_redundancy::{FleetRegistry, RoleHandle};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::peer::{BACKUPS_PATH, PING_PATH, RECEIVE_STATE_PATH, STATUS_PATH};

struct PeerApiState {
    hostname: String,
    registry: Arc<FleetRegistry>,
    role: RoleHandle,
}

/// Builder used to configure and spawn the peer endpoint.
#[derive(Clone)]
pub struct PeerApiBuilder {
    listen: SocketAddr,
    hostname: String,
    registry: Arc<FleetRegistry>,
    role: RoleHandle,
}

impl PeerApiBuilder {
    /// Construct a builder serving `registry` as `hostname`.
    pub fn new(
        listen: SocketAddr,
        hostname: impl Into<String>,
        registry: Arc<FleetRegistry>,
        role: RoleHandle,
    ) -> Self {
        Self {
            listen,
            hostname: hostname.into(),
            registry,
            role,
        }
    }

    /// Build the router without binding, for embedding in another server.
    pub fn router(&self) -> Router {
        let state = PeerApiState {
            hostname: self.hostname.clone(),
            registry: self.registry.clone(),
            role: self.role.clone(),
        };
        Router::new()
            .route(RECEIVE_STATE_PATH, post(receive_state))
            .route(PING_PATH, post(ping))
            .route(BACKUPS_PATH, get(list_backups))
            .route(STATUS_PATH, get(status))
            .with_state(Arc::new(state))
    }

    /// Bind and serve the endpoint until the returned handle is shut down.
    pub async fn spawn(self) -> anyhow::Result<PeerApiHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "peer api listening");

        let router = self.router();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "peer api server exited with error");
            }
        });

        Ok(PeerApiHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Handle returned from [`PeerApiBuilder::spawn`].
pub struct PeerApiHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl PeerApiHandle {
    /// Socket address the endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Request graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(join) => Err(anyhow::anyhow!(join)),
        }
    }
}

async fn receive_state(
    State(state): State<Arc<PeerApiState>>,
    Json(push): Json<StatePush>,
) -> Json<SocketResponse> {
    debug!(master = %push.master_hostname, "state push received");
    state.registry.apply_snapshot(push.hosts, push.backups);
    Json(SocketResponse::OK)
}

async fn ping(
    State(state): State<Arc<PeerApiState>>,
    Json(request): Json<PingRequest>,
) -> Json<PingResponse> {
    let is_master = state.role.is_master();
    if is_master {
        state
            .registry
            .refresh_host(&request.hostname, &request.ip_address, unix_now());
    }
    debug!(caller = %request.hostname, is_master, "ping answered");
    Json(PingResponse {
        hostname: state.hostname.clone(),
        is_master,
    })
}

async fn list_backups(State(state): State<Arc<PeerApiState>>) -> Json<Vec<BackupRecord>> {
    let backups = state
        .registry
        .list_backups()
        .into_iter()
        .map(BackupRecord::tagged)
        .collect();
    Json(backups)
}

async fn status(State(state): State<Arc<PeerApiState>>) -> Json<StatusReport> {
    let snapshot = state.role.snapshot();
    Json(StatusReport {
        hostname: state.hostname.clone(),
        role: snapshot.role,
        master: snapshot.master,
        hosts: state.registry.list_hosts(),
        backups: state.registry.list_backups(),
    })
}
