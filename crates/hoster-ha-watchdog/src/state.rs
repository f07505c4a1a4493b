//! ---
//! ha_section: "07-resilience-fault-tolerance"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Liveness watchdog state machine."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use hoster_ha_common::config::WatchdogConfig;
use tokio::time::Instant;

/// Observable watchdog states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchdogState {
    Healthy,
    Degraded,
    /// Terminal: the host is being fenced and rebooted.
    Fencing,
}

impl WatchdogState {
    pub const ALL: [WatchdogState; 3] = [
        WatchdogState::Healthy,
        WatchdogState::Degraded,
        WatchdogState::Fencing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WatchdogState::Healthy => "HEALTHY",
            WatchdogState::Degraded => "DEGRADED",
            WatchdogState::Fencing => "FENCING",
        }
    }
}

impl fmt::Display for WatchdogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks liveness pulses and counts consecutive checks that found none.
#[derive(Debug, Clone)]
pub struct Watchdog {
    interval: Duration,
    threshold: u32,
    last_pulse: Instant,
    missed: u32,
    state: WatchdogState,
}

impl Watchdog {
    /// `started_at` counts as the first pulse. A zero threshold is raised to one.
    pub fn new(interval: Duration, threshold: u32, started_at: Instant) -> Self {
        Self {
            interval,
            threshold: threshold.max(1),
            last_pulse: started_at,
            missed: 0,
            state: WatchdogState::Healthy,
        }
    }

    pub fn from_config(config: &WatchdogConfig, started_at: Instant) -> Self {
        Self::new(config.check_interval, config.missed_threshold, started_at)
    }

    pub fn record_pulse(&mut self, at: Instant) {
        if at > self.last_pulse {
            self.last_pulse = at;
        }
    }

    /// Evaluate one check. Once fencing has been entered it is never left.
    ///
    /// The threshold is tested before this check's own observation is counted,
    /// so fencing happens on the check after the last tolerated miss.
    pub fn check(&mut self, now: Instant) -> WatchdogState {
        if self.state == WatchdogState::Fencing {
            return self.state;
        }
        if self.missed >= self.threshold {
            self.state = WatchdogState::Fencing;
            return self.state;
        }
        if now.saturating_duration_since(self.last_pulse) > self.interval {
            self.missed += 1;
            self.state = WatchdogState::Degraded;
        } else {
            self.missed = 0;
            self.state = WatchdogState::Healthy;
        }
        self.state
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn missed_count(&self) -> u32 {
        self.missed
    }

    pub fn last_pulse(&self) -> Instant {
        self.last_pulse
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn fencing_follows_the_check_after_two_misses() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(secs(5), 2, start);
        assert_eq!(watchdog.check(start + secs(5)), WatchdogState::Healthy);
        assert_eq!(watchdog.check(start + secs(10)), WatchdogState::Degraded);
        assert_eq!(watchdog.check(start + secs(15)), WatchdogState::Degraded);
        assert_eq!(watchdog.missed_count(), 2);
        assert_eq!(watchdog.check(start + secs(20)), WatchdogState::Fencing);
    }

    #[test]
    fn pulse_before_threshold_check_cannot_undo_reached_threshold() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(secs(5), 2, start);
        watchdog.check(start + secs(10));
        watchdog.check(start + secs(15));
        watchdog.record_pulse(start + secs(19));
        assert_eq!(watchdog.check(start + secs(20)), WatchdogState::Fencing);
    }

    #[test]
    fn pulse_recovers_from_degraded() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(secs(5), 2, start);
        assert_eq!(watchdog.check(start + secs(6)), WatchdogState::Degraded);
        watchdog.record_pulse(start + secs(9));
        assert_eq!(watchdog.check(start + secs(11)), WatchdogState::Healthy);
        assert_eq!(watchdog.missed_count(), 0);
    }

    #[test]
    fn fencing_is_terminal() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(secs(5), 1, start);
        assert_eq!(watchdog.check(start + secs(6)), WatchdogState::Degraded);
        assert_eq!(watchdog.check(start + secs(7)), WatchdogState::Fencing);
        watchdog.record_pulse(start + secs(8));
        assert_eq!(watchdog.check(start + secs(9)), WatchdogState::Fencing);
    }

    #[test]
    fn stale_pulse_does_not_move_clock_backwards() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(secs(5), 2, start + secs(3));
        watchdog.record_pulse(start);
        assert_eq!(watchdog.last_pulse(), start + secs(3));
    }

    #[test]
    fn state_names_match_log_vocabulary() {
        let names: Vec<_> = WatchdogState::ALL.iter().map(|s| s.to_string()).collect();
        assert_eq!(names, vec!["HEALTHY", "DEGRADED", "FENCING"]);
    }
}
