//! ---
//! ha_section: "07-resilience-fault-tolerance"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Watchdog check loop, fencing and reboot."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::sync::Arc;

use hoster_ha_metrics::WatchdogMetrics;
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::actions::{Fencer, PulseEvent, PulseSource, Rebooter};
use crate::state::{Watchdog, WatchdogState};

/// How the watchdog loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    /// A termination request arrived before fencing.
    Terminated,
    /// Fencing ran and the reboot command was issued.
    Rebooted,
    /// Fencing ran and the reboot command failed.
    RebootFailed,
    /// Fencing ran; the reboot was skipped because debug mode is on.
    RebootSuppressed,
}

impl WatchdogExit {
    pub fn exit_code(self) -> i32 {
        match self {
            WatchdogExit::Terminated | WatchdogExit::Rebooted => 0,
            WatchdogExit::RebootFailed | WatchdogExit::RebootSuppressed => 1,
        }
    }
}

/// Collaborators of a watchdog run.
pub struct WatchdogActions {
    pub fencer: Arc<dyn Fencer>,
    pub rebooter: Arc<dyn Rebooter>,
    /// Skip the reboot and only log the decision.
    pub debug: bool,
    pub metrics: Option<WatchdogMetrics>,
}

/// Run the watchdog until it is terminated or has fenced the host.
///
/// Pulses are consumed on a dedicated task; checks run every interval starting
/// one interval after the call.
pub async fn run_watchdog<S: PulseSource>(
    watchdog: Watchdog,
    mut source: S,
    actions: WatchdogActions,
) -> WatchdogExit {
    if actions.debug {
        warn!("watchdog DEBUG MODE: fencing will run but the host will NOT be rebooted");
    }
    let period = watchdog.interval();
    let shared = Arc::new(Mutex::new(watchdog));

    let pulses = shared.clone();
    let mut listener = tokio::spawn(async move {
        while let Some(event) = source.next_event().await {
            match event {
                PulseEvent::Pulse => {
                    pulses.lock().record_pulse(Instant::now());
                    debug!("liveness pulse received");
                }
                PulseEvent::Terminate => return true,
            }
        }
        warn!("pulse source closed; no further pulses will be received");
        false
    });
    let mut listener_done = false;

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous = WatchdogState::Healthy;

    loop {
        tokio::select! {
            joined = &mut listener, if !listener_done => {
                listener_done = true;
                match joined {
                    Ok(true) => {
                        info!(state = %previous, "termination requested; watchdog exiting");
                        return WatchdogExit::Terminated;
                    }
                    Ok(false) => {}
                    Err(err) => error!(error = %err, "pulse listener task failed"),
                }
            }
            _ = ticker.tick() => {
                let (state, missed) = {
                    let mut watchdog = shared.lock();
                    let state = watchdog.check(Instant::now());
                    (state, watchdog.missed_count())
                };
                if let Some(metrics) = &actions.metrics {
                    if missed > 0 {
                        metrics.inc_missed();
                    }
                    let labels = WatchdogState::ALL.map(WatchdogState::as_str);
                    metrics.set_state(state.as_str(), &labels);
                }
                if state != previous {
                    info!(from = %previous, to = %state, missed, "watchdog state changed");
                    previous = state;
                }
                match state {
                    WatchdogState::Healthy => debug!("liveness check passed"),
                    WatchdogState::Degraded => warn!(missed, "liveness pulse missed"),
                    WatchdogState::Fencing => {
                        listener.abort();
                        return fence_and_reboot(&actions, missed).await;
                    }
                }
            }
        }
    }
}

async fn fence_and_reboot(actions: &WatchdogActions, missed: u32) -> WatchdogExit {
    if let Some(metrics) = &actions.metrics {
        metrics.inc_fencing();
    }
    if actions.debug {
        warn!(missed, "liveness lost; fencing (debug mode, reboot suppressed)");
    } else {
        error!(missed, "liveness lost; fencing and rebooting host");
    }
    if let Err(err) = actions.fencer.fence().await {
        error!(error = %err, "fencing failed; continuing to reboot");
    }
    if actions.debug {
        warn!("DEBUG MODE: reboot suppressed; the host would have been rebooted now");
        return WatchdogExit::RebootSuppressed;
    }
    match actions.rebooter.reboot().await {
        Ok(()) => WatchdogExit::Rebooted,
        Err(err) => {
            error!(error = %err, "reboot command failed");
            WatchdogExit::RebootFailed
        }
    }
}
