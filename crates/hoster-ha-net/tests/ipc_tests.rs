//! ---
//! ha_section: "05-networking-external-interfaces"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "IPC socket protocol scenarios."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hoster_ha_msg::{HostRecord, IpcMessage, SocketResponse};
use hoster_ha_net::IpcListener;
use hoster_ha_redundancy::FleetRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct Harness {
    _dir: tempfile::TempDir,
    path: std::path::PathBuf,
    registry: Arc<FleetRegistry>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

fn start() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ha.sock");
    std::fs::write(&path, b"stale").unwrap();
    let registry = Arc::new(FleetRegistry::new());
    let listener = IpcListener::bind(&path, registry.clone()).expect("stale file is replaced");
    let (shutdown, rx) = broadcast::channel(1);
    let task = tokio::spawn(listener.serve(rx));
    Harness {
        _dir: dir,
        path,
        registry,
        shutdown,
        task,
    }
}

async fn exchange(path: &Path, payload: &[u8]) -> Vec<u8> {
    let mut stream = UnixStream::connect(path).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    reply
}

#[tokio::test]
async fn host_add_is_applied_and_acknowledged() {
    let harness = start();
    let message = IpcMessage::HostAdd(HostRecord::new("node-b", "10.0.0.12", 1_700_000_000));

    let reply = exchange(&harness.path, &message.encode().unwrap()).await;
    let ack: SocketResponse = serde_json::from_slice(&reply).unwrap();
    assert_eq!(ack, SocketResponse::OK);

    let hosts = harness.registry.list_hosts();
    assert_eq!(hosts, vec![HostRecord::new("node-b", "10.0.0.12", 1_700_000_000)]);

    harness.shutdown.send(()).unwrap();
    harness.task.await.unwrap();
    assert!(!harness.path.exists());
}

#[tokio::test]
async fn repeated_backup_add_appends_twice() {
    let harness = start();
    let payload = br#"{"type":"backup_add","resource_type":"jail","resource_name":"dns01"}"#;

    for _ in 0..2 {
        let reply = exchange(&harness.path, payload).await;
        assert_eq!(serde_json::from_slice::<SocketResponse>(&reply).unwrap(), SocketResponse::OK);
    }
    let backups = harness.registry.list_backups();
    assert_eq!(backups.len(), 2);
    assert_eq!(backups[0].field("resource_name"), Some("dns01"));
}

#[tokio::test]
async fn unknown_type_gets_no_ack_and_no_mutation() {
    let harness = start();
    let reply = exchange(&harness.path, br#"{"type":"unknown_x","hostname":"node-b"}"#).await;
    assert!(reply.is_empty());
    assert_eq!(harness.registry.host_count(), 0);
    assert_eq!(harness.registry.backup_count(), 0);
}

#[tokio::test]
async fn undecodable_message_is_dropped_silently() {
    let harness = start();
    let reply = exchange(&harness.path, b"definitely not json").await;
    assert!(reply.is_empty());

    let reply = exchange(&harness.path, br#"{"type":"host_add","hostname":"node-b"}"#).await;
    assert!(reply.is_empty());
    assert_eq!(harness.registry.host_count(), 0);
}

#[tokio::test]
async fn ack_does_not_wait_for_writer_to_close() {
    let harness = start();
    let mut stream = UnixStream::connect(&harness.path).await.unwrap();
    stream
        .write_all(br#"{"type":"host_add","hostname":"node-c","ip_address":"10.0.0.13","last_seen":5}"#)
        .await
        .unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(serde_json::from_slice::<SocketResponse>(&reply).unwrap(), SocketResponse::OK);
    assert_eq!(harness.registry.host_count(), 1);
}

#[tokio::test]
async fn shutdown_finishes_connections_already_accepted() {
    let harness = start();
    let mut stream = UnixStream::connect(&harness.path).await.unwrap();
    stream
        .write_all(br#"{"type":"host_add","hostname":"node-d","#)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.shutdown.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!harness.task.is_finished());

    stream
        .write_all(br#""ip_address":"10.0.0.14","last_seen":7}"#)
        .await
        .unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(serde_json::from_slice::<SocketResponse>(&reply).unwrap(), SocketResponse::OK);

    harness.task.await.unwrap();
    assert_eq!(harness.registry.host_count(), 1);
    assert!(!harness.path.exists());
}
