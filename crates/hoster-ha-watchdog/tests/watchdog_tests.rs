//! ---
//! ha_section: "07-resilience-fault-tolerance"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Watchdog timing scenarios under a paused clock."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hoster_ha_watchdog::{
    run_watchdog, ChannelPulseSource, Fencer, PulseEvent, Rebooter, Watchdog, WatchdogActions,
    WatchdogError, WatchdogExit,
};
use tokio::time::Instant;

#[derive(Default)]
struct Recorder {
    fenced: AtomicUsize,
    rebooted: AtomicUsize,
    fail_fence: bool,
}

#[async_trait]
impl Fencer for Recorder {
    async fn fence(&self) -> Result<(), WatchdogError> {
        self.fenced.fetch_add(1, Ordering::SeqCst);
        if self.fail_fence {
            return Err(WatchdogError::EmptyCommand);
        }
        Ok(())
    }
}

#[async_trait]
impl Rebooter for Recorder {
    async fn reboot(&self) -> Result<(), WatchdogError> {
        self.rebooted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn actions(recorder: &Arc<Recorder>, debug: bool) -> WatchdogActions {
    WatchdogActions {
        fencer: recorder.clone(),
        rebooter: recorder.clone(),
        debug,
        metrics: None,
    }
}

fn watchdog() -> Watchdog {
    Watchdog::new(Duration::from_secs(5), 2, Instant::now())
}

#[tokio::test(start_paused = true)]
async fn steady_pulses_keep_the_host_up() {
    let recorder = Arc::new(Recorder::default());
    let (tx, source) = ChannelPulseSource::new(8);
    let run = tokio::spawn(run_watchdog(watchdog(), source, actions(&recorder, false)));

    for _ in 0..30 {
        tokio::time::sleep(Duration::from_secs(4)).await;
        tx.send(PulseEvent::Pulse).await.unwrap();
    }
    tx.send(PulseEvent::Terminate).await.unwrap();

    assert_eq!(run.await.unwrap(), WatchdogExit::Terminated);
    assert_eq!(recorder.fenced.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.rebooted.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn silence_fences_then_reboots() {
    let recorder = Arc::new(Recorder::default());
    let (_tx, source) = ChannelPulseSource::new(8);
    let started = Instant::now();

    let exit = run_watchdog(watchdog(), source, actions(&recorder, false)).await;

    assert_eq!(exit, WatchdogExit::Rebooted);
    assert_eq!(recorder.fenced.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.rebooted.load(Ordering::SeqCst), 1);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(15) && elapsed <= Duration::from_secs(20),
        "fenced after {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn debug_mode_fences_but_does_not_reboot() {
    let recorder = Arc::new(Recorder::default());
    let (_tx, source) = ChannelPulseSource::new(8);

    let exit = run_watchdog(watchdog(), source, actions(&recorder, true)).await;

    assert_eq!(exit, WatchdogExit::RebootSuppressed);
    assert_eq!(exit.exit_code(), 1);
    assert_eq!(recorder.fenced.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.rebooted.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_fencing_still_reboots() {
    let recorder = Arc::new(Recorder {
        fail_fence: true,
        ..Recorder::default()
    });
    let (_tx, source) = ChannelPulseSource::new(8);

    let exit = run_watchdog(watchdog(), source, actions(&recorder, false)).await;

    assert_eq!(exit, WatchdogExit::Rebooted);
    assert_eq!(recorder.rebooted.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn termination_bypasses_fencing_even_when_degraded() {
    let recorder = Arc::new(Recorder::default());
    let (tx, source) = ChannelPulseSource::new(8);
    let run = tokio::spawn(run_watchdog(watchdog(), source, actions(&recorder, false)));

    tokio::time::sleep(Duration::from_secs(11)).await;
    tx.send(PulseEvent::Terminate).await.unwrap();

    assert_eq!(run.await.unwrap(), WatchdogExit::Terminated);
    assert_eq!(recorder.fenced.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn closed_pulse_source_leads_to_fencing() {
    let recorder = Arc::new(Recorder::default());
    let (tx, source) = ChannelPulseSource::new(8);
    drop(tx);

    let exit = run_watchdog(watchdog(), source, actions(&recorder, true)).await;
    assert_eq!(exit, WatchdogExit::RebootSuppressed);
}
