//! ---
//! ha_section: "07-resilience-fault-tolerance"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Role monitoring, fleet registries, and offline detection."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
//! Local role tracking and fleet bookkeeping for Hoster HA nodes.

mod detector;
mod registry;
mod role;

pub use detector::{DetectionOutcome, FailureDetector};
pub use registry::{FleetRegistry, RegistryError};
pub use role::{
    parse_ifconfig, CarpInterface, CarpStatusSource, IfconfigStatusSource, RoleError, RoleHandle,
    RoleMonitor, RoleSnapshot,
};
