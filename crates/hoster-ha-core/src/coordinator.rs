//! ---
//! ha_section: "01-core-functionality"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Master-side fan-out, aggregation and master discovery."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use hoster_ha_metrics::CoordinatorMetrics;
use hoster_ha_msg::{BackupRecord, PingRequest, StatePush};
use hoster_ha_net::PeerTransport;
use hoster_ha_redundancy::{DetectionOutcome, FailureDetector, FleetRegistry, RoleHandle};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Outcome of one state fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReport {
    /// Local node is not master; nothing was sent.
    NotMaster,
    /// Every delivery finished, successfully or not.
    Completed {
        delivered: usize,
        failed: Vec<String>,
    },
}

/// Outcome of one backup inventory pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateReport {
    NotMaster,
    Completed {
        collected: usize,
        failed: Vec<String>,
    },
}

/// Master-side coordination operations over the fleet registry.
pub struct HaCoordinator {
    hostname: String,
    advertise_address: String,
    peers: Vec<String>,
    registry: Arc<FleetRegistry>,
    role: RoleHandle,
    transport: Arc<dyn PeerTransport>,
    detector: FailureDetector,
    metrics: Option<CoordinatorMetrics>,
}

impl HaCoordinator {
    pub fn new(
        hostname: impl Into<String>,
        registry: Arc<FleetRegistry>,
        role: RoleHandle,
        transport: Arc<dyn PeerTransport>,
        detector: FailureDetector,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            advertise_address: String::new(),
            peers: Vec::new(),
            registry,
            role,
            transport,
            detector,
            metrics: None,
        }
    }

    /// Address sent along with liveness probes.
    pub fn with_advertise_address(mut self, address: impl Into<String>) -> Self {
        self.advertise_address = address.into();
        self
    }

    /// Candidate addresses probed when looking for the master.
    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_metrics(mut self, metrics: CoordinatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn registry(&self) -> Arc<FleetRegistry> {
        self.registry.clone()
    }

    pub fn role(&self) -> RoleHandle {
        self.role.clone()
    }

    /// Push the full registry snapshot to every known host and wait for all deliveries.
    ///
    /// A failed delivery is logged and never affects the other deliveries or the
    /// host's offline flag.
    pub async fn sync_state(&self) -> SyncReport {
        if !self.role.is_master() {
            debug!("not master; skipping state fan-out");
            return SyncReport::NotMaster;
        }
        let hosts = self.registry.list_hosts();
        let push = Arc::new(StatePush {
            backups: self.registry.list_backups(),
            master_hostname: self.hostname.clone(),
            hosts,
        });

        let mut deliveries = JoinSet::new();
        for host in &push.hosts {
            let transport = self.transport.clone();
            let push = push.clone();
            let address = host.ip_address.clone();
            deliveries.spawn(async move {
                let result = transport.push_state(&address, &push).await;
                (address, result)
            });
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((address, Ok(()))) => {
                    delivered += 1;
                    self.record_push(&address, true);
                }
                Ok((address, Err(err))) => {
                    warn!(peer = %address, error = %err, "state push failed");
                    self.record_push(&address, false);
                    failed.push(address);
                }
                Err(join) => {
                    error!(error = %join, "state push task aborted");
                    failed.push(String::from("<aborted>"));
                }
            }
        }
        debug!(delivered, failed = failed.len(), "state fan-out finished");
        SyncReport::Completed { delivered, failed }
    }

    /// Pull every host's backup inventory and replace the local backup registry.
    pub async fn refresh_remote_backups(&self) -> AggregateReport {
        if !self.role.is_master() {
            debug!("not master; skipping backup aggregation");
            return AggregateReport::NotMaster;
        }
        let hosts = self.registry.list_hosts();
        let pulls = hosts.iter().map(|host| async move {
            let result = self.transport.fetch_backups(&host.ip_address).await;
            (host.ip_address.as_str(), result)
        });

        let mut collected: Vec<BackupRecord> = Vec::new();
        let mut failed = Vec::new();
        for (address, result) in join_all(pulls).await {
            match result {
                Ok(backups) => {
                    collected.extend(backups.into_iter().map(BackupRecord::strip_envelope));
                }
                Err(err) => {
                    warn!(peer = %address, error = %err, "backup pull failed");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_pull_failure(address);
                    }
                    failed.push(address.to_owned());
                }
            }
        }
        let count = collected.len();
        self.registry.replace_backups(collected);
        AggregateReport::Completed {
            collected: count,
            failed,
        }
    }

    pub fn detect_offline_hosts(&self, now: DateTime<Utc>) -> DetectionOutcome {
        let role = self.role.snapshot();
        let outcome = self.detector.detect_offline_hosts(&role, &self.registry, now);
        if let (Some(metrics), DetectionOutcome::Scanned { newly_offline }) = (&self.metrics, &outcome) {
            metrics.add_hosts_marked_offline(newly_offline.len());
            metrics.set_hosts_known(self.registry.host_count());
        }
        outcome
    }

    /// Probe for the current master, starting with the one already believed in.
    ///
    /// Returns the responder's hostname when a peer reports itself as master.
    pub async fn ping_master(&self) -> Option<String> {
        let request = PingRequest {
            hostname: self.hostname.clone(),
            ip_address: self.advertise_address.clone(),
        };
        for address in self.ping_candidates() {
            match self.transport.ping(&address, &request).await {
                Ok(reply) if reply.is_master => {
                    debug!(peer = %address, master = %reply.hostname, "master answered ping");
                    return Some(reply.hostname);
                }
                Ok(reply) => {
                    debug!(peer = %address, hostname = %reply.hostname, "peer is not master");
                }
                Err(err) => warn!(peer = %address, error = %err, "ping failed"),
            }
        }
        info!("no reachable master found; keeping cached master");
        None
    }

    fn ping_candidates(&self) -> Vec<String> {
        let mut candidates = Vec::new();
        if let Some(master) = self.role.current_master() {
            candidates.extend(
                self.registry
                    .list_hosts()
                    .into_iter()
                    .filter(|host| host.hostname == master)
                    .map(|host| host.ip_address),
            );
        }
        let fallback: Vec<String> = if self.peers.is_empty() {
            self.registry
                .list_hosts()
                .into_iter()
                .filter(|host| host.hostname != self.hostname)
                .map(|host| host.ip_address)
                .collect()
        } else {
            self.peers.clone()
        };
        for address in fallback {
            if address != self.advertise_address && !candidates.contains(&address) {
                candidates.push(address);
            }
        }
        candidates
    }

    fn record_push(&self, peer: &str, ok: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_push(peer, ok);
        }
    }
}
