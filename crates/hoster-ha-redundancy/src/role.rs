//! ---
//! ha_section: "07-resilience-fault-tolerance"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Role monitoring driven by CARP virtual-IP ownership."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hoster_ha_msg::Role;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Failures while querying virtual-IP ownership.
#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}")]
    Failed { command: String, status: ExitStatus },
    #[error("carp status unavailable: {0}")]
    Unavailable(String),
}

/// CARP state of one virtual host on one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarpInterface {
    pub interface: String,
    pub status: String,
    pub vhid: Option<u32>,
}

impl CarpInterface {
    pub fn is_master(&self) -> bool {
        self.status.eq_ignore_ascii_case("MASTER")
    }
}

/// Extract every `carp:` status line from `ifconfig` output.
///
/// Lines look like `carp: MASTER vhid 1 advbase 1 advskew 0` and belong to the
/// most recent unindented interface header.
pub fn parse_ifconfig(output: &str) -> Vec<CarpInterface> {
    let mut current = String::new();
    let mut found = Vec::new();
    for line in output.lines() {
        if !line.starts_with(char::is_whitespace) {
            if let Some((name, _)) = line.split_once(':') {
                current = name.trim().to_owned();
            }
            continue;
        }
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("carp:") {
            continue;
        }
        let Some(status) = tokens.next() else {
            continue;
        };
        let mut vhid = None;
        while let Some(token) = tokens.next() {
            if token == "vhid" {
                vhid = tokens.next().and_then(|value| value.parse().ok());
                break;
            }
        }
        found.push(CarpInterface {
            interface: current.clone(),
            status: status.to_owned(),
            vhid,
        });
    }
    found
}

/// Source of the virtual-IP ownership status.
#[async_trait]
pub trait CarpStatusSource: Send + Sync + 'static {
    async fn read_status(&self) -> Result<Vec<CarpInterface>, RoleError>;
}

/// Reads CARP status by running `ifconfig` (or a configured replacement).
#[derive(Debug, Clone)]
pub struct IfconfigStatusSource {
    command: String,
}

impl IfconfigStatusSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for IfconfigStatusSource {
    fn default() -> Self {
        Self::new("ifconfig")
    }
}

#[async_trait]
impl CarpStatusSource for IfconfigStatusSource {
    async fn read_status(&self) -> Result<Vec<CarpInterface>, RoleError> {
        let output = Command::new(&self.command)
            .output()
            .await
            .map_err(|source| RoleError::Spawn {
                command: self.command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(RoleError::Failed {
                command: self.command.clone(),
                status: output.status,
            });
        }
        Ok(parse_ifconfig(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Point-in-time view of the local role.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoleSnapshot {
    pub role: Role,
    /// Set on every BACKUP to MASTER transition, cleared on demotion.
    pub became_master_at: Option<DateTime<Utc>>,
    /// Hostname of the node currently believed to be master.
    pub master: Option<String>,
}

impl RoleSnapshot {
    pub fn is_master(&self) -> bool {
        self.role.is_master()
    }
}

/// Read side of the role state; cheap to clone and never blocks the writer.
#[derive(Debug, Clone)]
pub struct RoleHandle {
    rx: watch::Receiver<RoleSnapshot>,
}

impl RoleHandle {
    pub fn snapshot(&self) -> RoleSnapshot {
        self.rx.borrow().clone()
    }

    pub fn is_master(&self) -> bool {
        self.rx.borrow().is_master()
    }

    pub fn current_master(&self) -> Option<String> {
        self.rx.borrow().master.clone()
    }

    /// A handle pinned to a fixed snapshot, for callers that have no monitor.
    pub fn fixed(snapshot: RoleSnapshot) -> Self {
        let (tx, rx) = watch::channel(snapshot);
        // The receiver keeps the last value after the sender is gone.
        drop(tx);
        Self { rx }
    }
}

/// Derives MASTER/BACKUP from the CARP status and owns the role state.
///
/// There is exactly one monitor per process; it is the only writer of the role.
pub struct RoleMonitor {
    hostname: String,
    source: Arc<dyn CarpStatusSource>,
    state: watch::Sender<RoleSnapshot>,
}

impl RoleMonitor {
    pub fn new(hostname: impl Into<String>, source: Arc<dyn CarpStatusSource>) -> Self {
        let (state, _) = watch::channel(RoleSnapshot::default());
        Self {
            hostname: hostname.into(),
            source,
            state,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn subscribe(&self) -> RoleHandle {
        RoleHandle {
            rx: self.state.subscribe(),
        }
    }

    pub fn snapshot(&self) -> RoleSnapshot {
        self.state.borrow().clone()
    }

    /// Query the CARP status and update the role.
    ///
    /// A failed query keeps the previous role.
    pub async fn determine_role(&self, now: DateTime<Utc>) -> Role {
        let interfaces = match self.source.read_status().await {
            Ok(interfaces) => interfaces,
            Err(err) => {
                let previous = self.state.borrow().role;
                warn!(error = %err, role = %previous, "carp status unavailable; keeping previous role");
                return previous;
            }
        };
        let owns_vip = interfaces.iter().any(CarpInterface::is_master);
        let hostname = &self.hostname;
        self.state.send_modify(|state| {
            if owns_vip {
                if !state.role.is_master() {
                    state.became_master_at = Some(now);
                    info!(hostname = %hostname, "virtual ip acquired; now MASTER");
                }
                state.role = Role::Master;
                state.master = Some(hostname.clone());
            } else {
                if state.role.is_master() {
                    info!(hostname = %hostname, "virtual ip released; now BACKUP");
                    state.became_master_at = None;
                    state.master = None;
                }
                state.role = Role::Backup;
            }
        });
        debug!(interfaces = interfaces.len(), owns_vip, "carp status polled");
        self.state.borrow().role
    }

    /// Remember the master discovered by a liveness probe.
    pub fn record_master(&self, master: &str) {
        self.state.send_if_modified(|state| {
            if state.master.as_deref() == Some(master) {
                return false;
            }
            info!(master, "current master updated");
            state.master = Some(master.to_owned());
            true
        });
    }
}
