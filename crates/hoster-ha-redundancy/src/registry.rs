//! ---
//! ha_section: "07-resilience-fault-tolerance"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Lock-protected host and backup registries."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use hoster_ha_common::time::{elapsed_between, from_unix};
use hoster_ha_msg::{BackupRecord, HostRecord};
use parking_lot::RwLock;
use tracing::{debug, info};

/// Registry lookups that found nothing to act on.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("host `{0}` is not registered")]
    UnknownHost(String),
}

#[derive(Debug, Default)]
struct RegistryInner {
    hosts: Vec<HostRecord>,
    backups: Vec<BackupRecord>,
}

/// Known hosts and backup resources of the fleet.
///
/// Locks are held only for the in-memory mutation; readers always get copies.
/// Adds are plain appends: records carry no natural key, so a repeated
/// announcement produces a second entry.
#[derive(Debug, Default)]
pub struct FleetRegistry {
    inner: RwLock<RegistryInner>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, host: HostRecord) {
        debug!(hostname = %host.hostname, ip = %host.ip_address, "host added");
        self.inner.write().hosts.push(host);
    }

    pub fn list_hosts(&self) -> Vec<HostRecord> {
        self.inner.read().hosts.clone()
    }

    pub fn add_backup(&self, backup: BackupRecord) {
        self.inner.write().backups.push(backup);
    }

    pub fn list_backups(&self) -> Vec<BackupRecord> {
        self.inner.read().backups.clone()
    }

    pub fn replace_backups(&self, backups: Vec<BackupRecord>) {
        let count = backups.len();
        self.inner.write().backups = backups;
        debug!(count, "backup registry replaced");
    }

    /// Flag every record of `hostname` offline and return how many changed.
    pub fn mark_offline(&self, hostname: &str) -> Result<usize, RegistryError> {
        let mut inner = self.inner.write();
        let mut matched = false;
        let mut changed = 0;
        for host in inner.hosts.iter_mut().filter(|host| host.hostname == hostname) {
            matched = true;
            if !host.offline {
                host.offline = true;
                changed += 1;
            }
        }
        if matched {
            Ok(changed)
        } else {
            Err(RegistryError::UnknownHost(hostname.to_owned()))
        }
    }

    /// Replace both registries with a pushed snapshot. Last writer wins.
    pub fn apply_snapshot(&self, hosts: Vec<HostRecord>, backups: Vec<BackupRecord>) {
        let mut inner = self.inner.write();
        info!(
            hosts = hosts.len(),
            backups = backups.len(),
            "registries replaced from pushed snapshot"
        );
        inner.hosts = hosts;
        inner.backups = backups;
    }

    /// Record contact from `hostname`, clearing its offline flag.
    ///
    /// Every record with that hostname is refreshed; an unknown host is appended.
    pub fn refresh_host(&self, hostname: &str, ip_address: &str, seen_at: i64) {
        let mut inner = self.inner.write();
        let mut found = false;
        for host in inner.hosts.iter_mut().filter(|host| host.hostname == hostname) {
            found = true;
            host.ip_address = ip_address.to_owned();
            host.last_seen = seen_at;
            host.offline = false;
        }
        if !found {
            inner
                .hosts
                .push(HostRecord::new(hostname, ip_address, seen_at));
            info!(hostname, ip = ip_address, "previously unknown host registered by ping");
        }
    }

    /// Flag every host silent for longer than `failover_after` in one locked pass.
    ///
    /// Returns the hostnames that transitioned to offline during this pass.
    pub fn mark_stale_offline(&self, now: DateTime<Utc>, failover_after: Duration) -> Vec<String> {
        let mut inner = self.inner.write();
        let mut newly_offline = Vec::new();
        for host in inner.hosts.iter_mut() {
            let silent_for = elapsed_between(from_unix(host.last_seen), now);
            if silent_for > failover_after && !host.offline {
                host.offline = true;
                newly_offline.push(host.hostname.clone());
            }
        }
        newly_offline
    }

    pub fn host_count(&self) -> usize {
        self.inner.read().hosts.len()
    }

    pub fn offline_count(&self) -> usize {
        self.inner.read().hosts.iter().filter(|host| host.offline).count()
    }

    pub fn backup_count(&self) -> usize {
        self.inner.read().backups.len()
    }
}
