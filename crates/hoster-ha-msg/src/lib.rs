//! ---
//! ha_section: "02-messaging-ipc-data-model"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Message schema helpers and protocol codecs."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Records and envelopes exchanged over the local IPC socket and between peers.

pub mod types;

/// Shared result type for encoding and decoding.
pub type Result<T> = std::result::Result<T, MessageError>;

/// Failures raised while decoding or encoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The `{type}` envelope could not be read at all.
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    /// The envelope was recognised but its body did not match the expected record.
    #[error("malformed {kind} payload: {source}")]
    Payload {
        /// Discriminant taken from the envelope.
        kind: String,
        /// Underlying decode failure.
        #[source]
        source: serde_json::Error,
    },
    /// Serialising an outgoing message failed.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

pub use types::{
    BackupRecord, HostRecord, IpcMessage, PingRequest, PingResponse, Role, SocketResponse,
    StatePush, StatusReport, BACKUP_ADD, HOST_ADD,
};
