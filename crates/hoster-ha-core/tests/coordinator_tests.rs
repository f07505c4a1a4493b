//! ---
//! ha_section: "01-core-functionality"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Coordinator fan-out, aggregation and runtime lifecycle."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hoster_ha_common::time::from_unix;
use hoster_ha_core::{AggregateReport, HaCoordinator, HaRuntime, SyncReport};
use hoster_ha_msg::{BackupRecord, HostRecord, PingRequest, PingResponse, Role, StatePush};
use hoster_ha_net::{PeerError, PeerTransport};
use hoster_ha_redundancy::{
    CarpInterface, CarpStatusSource, FailureDetector, FleetRegistry, RoleError, RoleHandle,
    RoleMonitor, RoleSnapshot,
};
use parking_lot::Mutex;
use serde_json::json;

#[derive(Default)]
struct FakeTransport {
    pushes: AtomicUsize,
    pulls: AtomicUsize,
    pushed_to: Mutex<Vec<String>>,
    failing: HashSet<String>,
    inventories: HashMap<String, Vec<BackupRecord>>,
    masters: HashMap<String, String>,
}

impl FakeTransport {
    fn failure(address: &str) -> PeerError {
        PeerError::Timeout {
            peer: address.to_owned(),
            timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn push_state(&self, address: &str, _push: &StatePush) -> Result<(), PeerError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.pushed_to.lock().push(address.to_owned());
        if self.failing.contains(address) {
            return Err(Self::failure(address));
        }
        Ok(())
    }

    async fn fetch_backups(&self, address: &str) -> Result<Vec<BackupRecord>, PeerError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(address) {
            return Err(Self::failure(address));
        }
        Ok(self.inventories.get(address).cloned().unwrap_or_default())
    }

    async fn ping(&self, address: &str, _request: &PingRequest) -> Result<PingResponse, PeerError> {
        if self.failing.contains(address) {
            return Err(Self::failure(address));
        }
        Ok(match self.masters.get(address) {
            Some(hostname) => PingResponse {
                hostname: hostname.clone(),
                is_master: true,
            },
            None => PingResponse {
                hostname: format!("host-{address}"),
                is_master: false,
            },
        })
    }
}

fn role(role: Role) -> RoleHandle {
    RoleHandle::fixed(RoleSnapshot {
        role,
        became_master_at: role.is_master().then(|| from_unix(1_000)),
        master: None,
    })
}

fn coordinator(role_handle: RoleHandle, transport: Arc<FakeTransport>) -> (HaCoordinator, Arc<FleetRegistry>) {
    let registry = Arc::new(FleetRegistry::new());
    let coordinator = HaCoordinator::new(
        "node-a",
        registry.clone(),
        role_handle,
        transport,
        FailureDetector::default(),
    );
    (coordinator, registry)
}

fn tagged_backup(name: &str) -> BackupRecord {
    let serde_json::Value::Object(map) = json!({ "resource_type": "vm", "resource_name": name })
    else {
        unreachable!()
    };
    BackupRecord::new(map).tagged()
}

#[tokio::test]
async fn empty_registry_sends_nothing() {
    let transport = Arc::new(FakeTransport::default());
    let (coordinator, _) = coordinator(role(Role::Master), transport.clone());
    assert_eq!(
        coordinator.sync_state().await,
        SyncReport::Completed {
            delivered: 0,
            failed: vec![]
        }
    );
    assert_eq!(transport.pushes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn one_failing_peer_does_not_stop_the_others() {
    let transport = Arc::new(FakeTransport {
        failing: HashSet::from(["10.0.0.13".to_owned()]),
        ..FakeTransport::default()
    });
    let (coordinator, registry) = coordinator(role(Role::Master), transport.clone());
    for (name, ip) in [("node-a", "10.0.0.11"), ("node-b", "10.0.0.12"), ("node-c", "10.0.0.13")] {
        registry.add_host(HostRecord::new(name, ip, 1_000));
    }

    let report = coordinator.sync_state().await;
    assert_eq!(
        report,
        SyncReport::Completed {
            delivered: 2,
            failed: vec!["10.0.0.13".into()]
        }
    );
    let mut pushed = transport.pushed_to.lock().clone();
    pushed.sort();
    assert_eq!(pushed, vec!["10.0.0.11", "10.0.0.12", "10.0.0.13"]);
    assert_eq!(registry.offline_count(), 0);
}

#[tokio::test]
async fn backup_role_skips_fan_out_and_aggregation() {
    let transport = Arc::new(FakeTransport::default());
    let (coordinator, registry) = coordinator(role(Role::Backup), transport.clone());
    registry.add_host(HostRecord::new("node-b", "10.0.0.12", 1_000));

    assert_eq!(coordinator.sync_state().await, SyncReport::NotMaster);
    assert_eq!(coordinator.refresh_remote_backups().await, AggregateReport::NotMaster);
    assert_eq!(transport.pushes.load(Ordering::SeqCst), 0);
    assert_eq!(transport.pulls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn aggregation_strips_envelopes_and_replaces_registry() {
    let transport = Arc::new(FakeTransport {
        failing: HashSet::from(["10.0.0.13".to_owned()]),
        inventories: HashMap::from([
            ("10.0.0.11".to_owned(), vec![tagged_backup("web01")]),
            ("10.0.0.12".to_owned(), vec![tagged_backup("db01"), tagged_backup("db02")]),
        ]),
        ..FakeTransport::default()
    });
    let (coordinator, registry) = coordinator(role(Role::Master), transport);
    for (name, ip) in [("node-a", "10.0.0.11"), ("node-b", "10.0.0.12"), ("node-c", "10.0.0.13")] {
        registry.add_host(HostRecord::new(name, ip, 1_000));
    }
    registry.add_backup(tagged_backup("stale"));

    let report = coordinator.refresh_remote_backups().await;
    assert_eq!(
        report,
        AggregateReport::Completed {
            collected: 3,
            failed: vec!["10.0.0.13".into()]
        }
    );
    let backups = registry.list_backups();
    let names: Vec<_> = backups.iter().filter_map(|b| b.field("resource_name")).collect();
    assert_eq!(names, vec!["web01", "db01", "db02"]);
    assert!(backups.iter().all(|b| b.payload_type.is_none()));
}

#[tokio::test]
async fn ping_master_returns_first_master_responder() {
    let transport = Arc::new(FakeTransport {
        failing: HashSet::from(["10.0.0.12".to_owned()]),
        masters: HashMap::from([("10.0.0.14".to_owned(), "node-d".to_owned())]),
        ..FakeTransport::default()
    });
    let (coordinator, _) = coordinator(role(Role::Backup), transport);
    let coordinator = coordinator.with_advertise_address("10.0.0.11").with_peers(vec![
        "10.0.0.11".into(),
        "10.0.0.12".into(),
        "10.0.0.13".into(),
        "10.0.0.14".into(),
    ]);
    assert_eq!(coordinator.ping_master().await.as_deref(), Some("node-d"));
}

#[tokio::test]
async fn ping_master_without_master_keeps_nothing() {
    let transport = Arc::new(FakeTransport::default());
    let (coordinator, _) = coordinator(role(Role::Backup), transport);
    let coordinator = coordinator.with_peers(vec!["10.0.0.12".into()]);
    assert_eq!(coordinator.ping_master().await, None);
}

struct AlwaysMaster;

#[async_trait]
impl CarpStatusSource for AlwaysMaster {
    async fn read_status(&self) -> Result<Vec<CarpInterface>, RoleError> {
        Ok(vec![CarpInterface {
            interface: "vtnet0".into(),
            status: "MASTER".into(),
            vhid: Some(1),
        }])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runtime_pushes_while_master_and_stops_cleanly() {
    let transport = Arc::new(FakeTransport::default());
    let monitor = RoleMonitor::new("node-a", Arc::new(AlwaysMaster));
    let registry = Arc::new(FleetRegistry::new());
    registry.add_host(HostRecord::new("node-b", "10.0.0.12", 1_000));
    let coordinator = Arc::new(HaCoordinator::new(
        "node-a",
        registry.clone(),
        monitor.subscribe(),
        transport.clone(),
        FailureDetector::default(),
    ));
    let role_handle = coordinator.role();

    let handle = HaRuntime::new(monitor, coordinator, Duration::from_millis(20)).start();
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.shutdown().await.unwrap();

    assert!(role_handle.is_master());
    assert!(transport.pushes.load(Ordering::SeqCst) > 0);
    // Freshly promoted: the settle window keeps the stale host online.
    assert_eq!(registry.offline_count(), 0);
}

#[derive(Default)]
struct CountingBackupSource {
    reads: AtomicUsize,
}

#[async_trait]
impl CarpStatusSource for CountingBackupSource {
    async fn read_status(&self) -> Result<Vec<CarpInterface>, RoleError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(vec![CarpInterface {
            interface: "vtnet0".into(),
            status: "BACKUP".into(),
            vhid: Some(1),
        }])
    }
}

/// Every peer hangs for a full second and then fails, as during a failover.
struct UnresponsivePeers;

#[async_trait]
impl PeerTransport for UnresponsivePeers {
    async fn push_state(&self, address: &str, _push: &StatePush) -> Result<(), PeerError> {
        Err(FakeTransport::failure(address))
    }

    async fn fetch_backups(&self, address: &str) -> Result<Vec<BackupRecord>, PeerError> {
        Err(FakeTransport::failure(address))
    }

    async fn ping(&self, address: &str, _request: &PingRequest) -> Result<PingResponse, PeerError> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Err(FakeTransport::failure(address))
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_master_probes_do_not_slow_role_polling() {
    let source = Arc::new(CountingBackupSource::default());
    let monitor = RoleMonitor::new("node-a", source.clone());
    let coordinator = HaCoordinator::new(
        "node-a",
        Arc::new(FleetRegistry::new()),
        monitor.subscribe(),
        Arc::new(UnresponsivePeers),
        FailureDetector::default(),
    )
    .with_advertise_address("10.0.0.11")
    .with_peers(vec![
        "10.0.0.12".into(),
        "10.0.0.13".into(),
        "10.0.0.14".into(),
    ]);

    let handle = HaRuntime::new(monitor, Arc::new(coordinator), Duration::from_secs(1)).start();
    tokio::time::sleep(Duration::from_secs(30)).await;
    handle.shutdown().await.unwrap();

    let reads = source.reads.load(Ordering::SeqCst);
    assert!(reads >= 25, "carp status read {reads} times in 30s at a 1s poll");
}
