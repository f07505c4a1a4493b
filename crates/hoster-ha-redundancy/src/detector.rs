//! ---
//! ha_section: "07-resilience-fault-tolerance"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Offline detection for silent fleet members."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use hoster_ha_common::config::{CarpConfig, MIN_SETTLE_WINDOW};
use hoster_ha_common::time::elapsed_between;
use tracing::{debug, warn};

use crate::registry::FleetRegistry;
use crate::role::RoleSnapshot;

/// Result of one detection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// Local node is not master; nothing was scanned.
    NotMaster,
    /// Promotion is too recent; side effects are suppressed.
    Settling { remaining: Duration },
    /// Registry was scanned; lists hosts that went offline during this pass.
    Scanned { newly_offline: Vec<String> },
}

/// Marks hosts offline once they have been silent longer than `failover_after`.
#[derive(Debug, Clone)]
pub struct FailureDetector {
    failover_after: Duration,
    settle_window: Duration,
}

impl FailureDetector {
    /// The settle window is never shorter than [`MIN_SETTLE_WINDOW`].
    pub fn new(failover_after: Duration, settle_window: Duration) -> Self {
        Self {
            failover_after,
            settle_window: settle_window.max(MIN_SETTLE_WINDOW),
        }
    }

    pub fn from_config(config: &CarpConfig) -> Self {
        Self::new(config.failover_after, config.settle_window)
    }

    pub fn settle_window(&self) -> Duration {
        self.settle_window
    }

    pub fn detect_offline_hosts(
        &self,
        role: &RoleSnapshot,
        registry: &FleetRegistry,
        now: DateTime<Utc>,
    ) -> DetectionOutcome {
        if !role.is_master() {
            return DetectionOutcome::NotMaster;
        }
        let Some(promoted_at) = role.became_master_at else {
            // MASTER without a recorded promotion time still counts as settling.
            return DetectionOutcome::Settling {
                remaining: self.settle_window,
            };
        };
        let since_promotion = elapsed_between(promoted_at, now);
        if since_promotion < self.settle_window {
            let remaining = self.settle_window - since_promotion;
            debug!(remaining_secs = remaining.as_secs(), "settle window active; skipping detection");
            return DetectionOutcome::Settling { remaining };
        }

        let newly_offline = registry.mark_stale_offline(now, self.failover_after);
        for hostname in &newly_offline {
            warn!(hostname = %hostname, failover_after_secs = self.failover_after.as_secs(), "host marked offline");
        }
        DetectionOutcome::Scanned { newly_offline }
    }
}

impl Default for FailureDetector {
    fn default() -> Self {
        Self::from_config(&CarpConfig::default())
    }
}
