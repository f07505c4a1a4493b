//! ---
//! ha_section: "05-networking-external-interfaces"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Local IPC socket and peer HTTP protocols."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Network surfaces of a Hoster HA node: the local IPC socket fed by the API
//! process, and the peer protocols spoken between fleet members.

pub mod api;
pub mod ipc;
pub mod peer;

pub use api::{PeerApiBuilder, PeerApiHandle};
pub use ipc::{handle_connection, Dispatch, IpcError, IpcListener, MAX_MESSAGE_BYTES};
pub use peer::{HttpPeerClient, PeerError, PeerTransport};
