//! ---
//! ha_section: "02-messaging-ipc-data-model"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Message schema helpers and protocol codecs."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{MessageError, Result};

/// Discriminant of an IPC message announcing a host.
pub const HOST_ADD: &str = "host_add";
/// Discriminant of an IPC message announcing a backup resource.
pub const BACKUP_ADD: &str = "backup_add";

/// A fleet member as known to this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Host name reported by the node itself.
    pub hostname: String,
    /// Address the peer protocols use to reach the node.
    pub ip_address: String,
    /// Unix seconds of the last contact with the node.
    pub last_seen: i64,
    /// Set by the failure detector once the node has been silent too long.
    #[serde(default)]
    pub offline: bool,
}

impl HostRecord {
    /// Construct an online record.
    pub fn new(hostname: impl Into<String>, ip_address: impl Into<String>, last_seen: i64) -> Self {
        Self {
            hostname: hostname.into(),
            ip_address: ip_address.into(),
            last_seen,
            offline: false,
        }
    }
}

/// A replicable resource (VM or jail) as reported by the node that owns it.
///
/// The core only looks at the transport discriminant; everything else is carried
/// through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Transport discriminant (`backup_add`) present on IPC and pull payloads.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<String>,
    /// Resource identity and metadata.
    #[serde(flatten)]
    pub resource: Map<String, JsonValue>,
}

impl BackupRecord {
    /// Wrap a resource description without any transport discriminant.
    pub fn new(resource: Map<String, JsonValue>) -> Self {
        Self {
            payload_type: None,
            resource,
        }
    }

    /// Attach the `backup_add` discriminant for transmission.
    pub fn tagged(mut self) -> Self {
        self.payload_type = Some(BACKUP_ADD.to_owned());
        self
    }

    /// Remove the transport discriminant, leaving only the resource description.
    pub fn strip_envelope(mut self) -> Self {
        self.payload_type = None;
        self
    }

    /// Convenience accessor for a string field of the resource.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.resource.get(key).and_then(JsonValue::as_str)
    }
}

#[derive(Deserialize)]
struct IpcEnvelope {
    #[serde(rename = "type")]
    kind: String,
}

/// A decoded IPC message, dispatched on its `type` discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcMessage {
    /// `host_add`: append a host record.
    HostAdd(HostRecord),
    /// `backup_add`: append a backup record.
    BackupAdd(BackupRecord),
    /// Any other discriminant; carries the discriminant for logging.
    Unknown(String),
}

impl IpcMessage {
    /// Decode a raw IPC payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let IpcEnvelope { kind } =
            serde_json::from_slice(bytes).map_err(MessageError::Envelope)?;
        let decoded = match kind.as_str() {
            HOST_ADD => serde_json::from_slice(bytes).map(IpcMessage::HostAdd),
            BACKUP_ADD => serde_json::from_slice(bytes).map(IpcMessage::BackupAdd),
            _ => return Ok(IpcMessage::Unknown(kind.clone())),
        };
        decoded.map_err(|source| MessageError::Payload { kind, source })
    }

    /// Encode the message as the API process would send it.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let value = match self {
            IpcMessage::HostAdd(host) => {
                let mut value = serde_json::to_value(host).map_err(MessageError::Encode)?;
                if let Some(object) = value.as_object_mut() {
                    object.insert("type".into(), JsonValue::from(HOST_ADD));
                }
                value
            }
            IpcMessage::BackupAdd(backup) => {
                serde_json::to_value(backup.clone().tagged()).map_err(MessageError::Encode)?
            }
            IpcMessage::Unknown(kind) => serde_json::json!({ "type": kind }),
        };
        serde_json::to_vec(&value).map_err(MessageError::Encode)
    }

    /// The discriminant carried by the message.
    pub fn kind(&self) -> &str {
        match self {
            IpcMessage::HostAdd(_) => HOST_ADD,
            IpcMessage::BackupAdd(_) => BACKUP_ADD,
            IpcMessage::Unknown(kind) => kind,
        }
    }
}

/// Acknowledgement written back on the IPC socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketResponse {
    /// Whether the message was accepted.
    pub success: bool,
}

impl SocketResponse {
    /// Positive acknowledgement.
    pub const OK: SocketResponse = SocketResponse { success: true };
}

/// Snapshot pushed by the master to every known peer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatePush {
    /// Full host registry of the master.
    #[serde(default)]
    pub hosts: Vec<HostRecord>,
    /// Full backup registry of the master.
    #[serde(default)]
    pub backups: Vec<BackupRecord>,
    /// Identity of the pushing master.
    pub master_hostname: String,
}

/// Liveness probe sent by a node looking for the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    /// Identity of the probing node.
    pub hostname: String,
    /// Address of the probing node.
    pub ip_address: String,
}

/// Reply to a [`PingRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Identity of the responder.
    pub hostname: String,
    /// Whether the responder currently holds the MASTER role.
    #[serde(default)]
    pub is_master: bool,
}

/// Local role derived from virtual-IP ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// Holds the virtual IP.
    Master,
    /// Does not hold the virtual IP.
    #[default]
    Backup,
}

impl Role {
    /// True for [`Role::Master`].
    pub fn is_master(self) -> bool {
        matches!(self, Role::Master)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("MASTER"),
            Role::Backup => f.write_str("BACKUP"),
        }
    }
}

/// Operator view of a node's HA state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Identity of the reporting node.
    pub hostname: String,
    /// Current local role.
    pub role: Role,
    /// Master the node currently believes in, if any.
    pub master: Option<String>,
    /// Host registry snapshot.
    pub hosts: Vec<HostRecord>,
    /// Backup registry snapshot.
    pub backups: Vec<BackupRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn host_add_decodes_into_record() {
        let raw = br#"{"type":"host_add","hostname":"node-b","ip_address":"10.0.0.12","last_seen":1700000000}"#;
        let message = IpcMessage::decode(raw).expect("decodes");
        assert_eq!(
            message,
            IpcMessage::HostAdd(HostRecord::new("node-b", "10.0.0.12", 1_700_000_000))
        );
        assert_eq!(message.kind(), HOST_ADD);
    }

    #[test]
    fn backup_add_keeps_opaque_fields() {
        let raw = json!({
            "type": "backup_add",
            "resource_type": "vm",
            "resource_name": "web01",
            "parent_host": "node-b",
            "disks": ["disk0.img"]
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        let IpcMessage::BackupAdd(backup) = IpcMessage::decode(&bytes).unwrap() else {
            panic!("expected backup_add");
        };
        assert_eq!(backup.payload_type.as_deref(), Some(BACKUP_ADD));
        assert_eq!(backup.field("resource_name"), Some("web01"));
        assert_eq!(backup.resource.get("disks"), Some(&json!(["disk0.img"])));

        let stripped = serde_json::to_value(backup.strip_envelope()).unwrap();
        assert!(stripped.get("type").is_none());
        assert_eq!(stripped["resource_type"], "vm");
    }

    #[test]
    fn unknown_discriminant_is_reported_not_rejected() {
        let message = IpcMessage::decode(br#"{"type":"unknown_x","foo":1}"#).unwrap();
        assert_eq!(message, IpcMessage::Unknown("unknown_x".into()));
    }

    #[test]
    fn missing_envelope_is_an_envelope_error() {
        let err = IpcMessage::decode(b"not json").unwrap_err();
        assert!(matches!(err, MessageError::Envelope(_)));
        let err = IpcMessage::decode(br#"{"hostname":"node-b"}"#).unwrap_err();
        assert!(matches!(err, MessageError::Envelope(_)));
    }

    #[test]
    fn recognised_type_with_bad_body_is_a_payload_error() {
        let err = IpcMessage::decode(br#"{"type":"host_add","hostname":"node-b"}"#).unwrap_err();
        match err {
            MessageError::Payload { kind, .. } => assert_eq!(kind, HOST_ADD),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn encoded_host_add_carries_discriminant() {
        let message = IpcMessage::HostAdd(HostRecord::new("node-c", "10.0.0.13", 42));
        let value: JsonValue = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(value["type"], HOST_ADD);
        assert_eq!(value["offline"], false);
    }

    #[test]
    fn role_serialises_in_upper_case() {
        assert_eq!(serde_json::to_value(Role::Master).unwrap(), json!("MASTER"));
        assert_eq!(Role::Backup.to_string(), "BACKUP");
    }
}
