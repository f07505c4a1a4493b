//! ---
//! ha_section: "07-resilience-fault-tolerance"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Pulse sources and fencing/reboot actions."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Default bound on each fencing or reboot command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Watchdog failures.
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("failed to install {signal} handler: {source}")]
    Signal {
        signal: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("command is empty")]
    EmptyCommand,
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}")]
    Failed { command: String, status: ExitStatus },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

/// Something delivered by the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseEvent {
    /// The supervised process is alive.
    Pulse,
    /// Clean shutdown requested.
    Terminate,
}

/// Channel over which liveness pulses arrive.
#[async_trait]
pub trait PulseSource: Send + 'static {
    /// Next event, or `None` once the source can produce no more.
    async fn next_event(&mut self) -> Option<PulseEvent>;
}

/// Pulses on SIGHUP; SIGTERM and SIGINT request termination.
pub struct SignalPulseSource {
    hangup: Signal,
    terminate: Signal,
    interrupt: Signal,
}

impl SignalPulseSource {
    pub fn install() -> Result<Self, WatchdogError> {
        let install = |kind: SignalKind, name: &'static str| {
            signal(kind).map_err(|source| WatchdogError::Signal {
                signal: name,
                source,
            })
        };
        Ok(Self {
            hangup: install(SignalKind::hangup(), "SIGHUP")?,
            terminate: install(SignalKind::terminate(), "SIGTERM")?,
            interrupt: install(SignalKind::interrupt(), "SIGINT")?,
        })
    }

    /// Install the handlers, then publish this process id at `pid_file`.
    ///
    /// The file is how the supervised process finds the watchdog, so it must
    /// not exist before SIGHUP is handled; the default action would kill us.
    pub fn install_and_announce(pid_file: Option<&Path>) -> Result<Self, WatchdogError> {
        let source = Self::install()?;
        if let Some(path) = pid_file {
            write_pid_file(path)?;
            info!(path = %path.display(), pid = std::process::id(), "pid file written");
        }
        Ok(source)
    }
}

fn write_pid_file(path: &Path) -> Result<(), WatchdogError> {
    let to_error = |source| WatchdogError::PidFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(to_error)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id())).map_err(to_error)
}

#[async_trait]
impl PulseSource for SignalPulseSource {
    async fn next_event(&mut self) -> Option<PulseEvent> {
        tokio::select! {
            received = self.hangup.recv() => received.map(|_| PulseEvent::Pulse),
            received = self.terminate.recv() => received.map(|_| PulseEvent::Terminate),
            received = self.interrupt.recv() => received.map(|_| PulseEvent::Terminate),
        }
    }
}

/// In-process pulse source fed through an mpsc channel.
#[derive(Debug)]
pub struct ChannelPulseSource {
    rx: mpsc::Receiver<PulseEvent>,
}

impl ChannelPulseSource {
    pub fn new(buffer: usize) -> (mpsc::Sender<PulseEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl PulseSource for ChannelPulseSource {
    async fn next_event(&mut self) -> Option<PulseEvent> {
        self.rx.recv().await
    }
}

/// Locks every managed VM against further writes.
#[async_trait]
pub trait Fencer: Send + Sync + 'static {
    async fn fence(&self) -> Result<(), WatchdogError>;
}

/// Forces the host down.
#[async_trait]
pub trait Rebooter: Send + Sync + 'static {
    async fn reboot(&self) -> Result<(), WatchdogError>;
}

/// Runs an external command with a bounded wait.
#[derive(Debug, Clone)]
pub struct CommandAction {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandAction {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }

    pub async fn run(&self) -> Result<(), WatchdogError> {
        let (program, args) = self.argv.split_first().ok_or(WatchdogError::EmptyCommand)?;
        let command = self.display();
        debug!(command = %command, "running command");
        let mut child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WatchdogError::Spawn {
                command: command.clone(),
                source,
            })?;
        let status = tokio::time::timeout(self.timeout, child.wait())
            .await
            .map_err(|_| WatchdogError::Timeout {
                command: command.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| WatchdogError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !status.success() {
            return Err(WatchdogError::Failed { command, status });
        }
        info!(command = %command, "command completed");
        Ok(())
    }
}

#[async_trait]
impl Fencer for CommandAction {
    async fn fence(&self) -> Result<(), WatchdogError> {
        self.run().await
    }
}

#[async_trait]
impl Rebooter for CommandAction {
    async fn reboot(&self) -> Result<(), WatchdogError> {
        self.run().await
    }
}
