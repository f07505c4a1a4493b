//! ---
//! ha_section: "01-core-functionality"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Shared primitives and utilities for the HA runtime."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Current wall-clock time in the form stored on host records.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Convert a unix timestamp carried on the wire back into a [`DateTime`].
///
/// Out-of-range values clamp to the epoch so that a corrupt record reads as very old.
pub fn from_unix(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or_default()
}

/// Elapsed time between two instants, saturating at zero when `later` precedes `earlier`.
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
