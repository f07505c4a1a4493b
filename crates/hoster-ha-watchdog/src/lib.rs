//! ---
//! ha_section: "07-resilience-fault-tolerance"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Liveness watchdog with fencing and forced reboot."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
//! Supervises the liveness pulses of the API process and fences the host
//! when they stop.

mod actions;
mod runner;
mod state;

pub use actions::{
    ChannelPulseSource, CommandAction, Fencer, PulseEvent, PulseSource, Rebooter,
    SignalPulseSource, WatchdogError, DEFAULT_COMMAND_TIMEOUT,
};
pub use runner::{run_watchdog, WatchdogActions, WatchdogExit};
pub use state::{Watchdog, WatchdogState};
