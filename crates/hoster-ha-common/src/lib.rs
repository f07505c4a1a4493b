//! ---
//! ha_section: "01-core-functionality"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Shared primitives and utilities for the HA runtime."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
//! Shared primitives for the Hoster HA workspace.
//! This crate exposes configuration loading, logging setup, and the
//! time helpers used on host records.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, CarpConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, WatchdogConfig,
    DEFAULT_CONFIG_PATH, MIN_SETTLE_WINDOW,
};
pub use logging::{flush_logs, init_tracing, LogFormat};
