//! ---
//! ha_section: "01-core-functionality"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Primary coordination and lifecycle management."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
//! Coordination runtime for a Hoster HA node: state fan-out, backup
//! aggregation, offline detection and master discovery on a fixed cadence.

pub mod coordinator;
pub mod runtime;

pub use coordinator::{AggregateReport, HaCoordinator, SyncReport};
pub use runtime::{HaRuntime, HaRuntimeHandle};
