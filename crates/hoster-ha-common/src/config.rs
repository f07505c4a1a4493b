//! ---
//! ha_section: "01-core-functionality"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Shared primitives and utilities for the HA runtime."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Shortest settle window accepted after a BACKUP to MASTER transition.
pub const MIN_SETTLE_WINDOW: Duration = Duration::from_secs(25);

/// Well-known location of the HA configuration on a Hoster node.
pub const DEFAULT_CONFIG_PATH: &str = "/opt/hoster-core/config_files/ha_config.toml";

fn default_peer_port() -> u16 {
    3000
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], default_peer_port()))
}

fn default_failover_after() -> Duration {
    Duration::from_secs(50)
}

fn default_settle_window() -> Duration {
    MIN_SETTLE_WINDOW
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/hoster_ha_carp.sock")
}

fn default_carp_status_command() -> String {
    "ifconfig".to_owned()
}

fn default_check_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_missed_threshold() -> u32 {
    2
}

fn default_fence_command() -> Vec<String> {
    vec!["hoster".to_owned(), "vm".to_owned(), "lock-all".to_owned()]
}

fn default_reboot_command() -> Vec<String> {
    vec!["reboot".to_owned()]
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("/var/log/hoster-ha")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

fn default_watchdog_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9900))
}

/// Top-level configuration shared by the coordinator and the watchdog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub carp: CarpConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "HOSTER_HA_CONFIG";

    /// Load configuration from disk, respecting the `HOSTER_HA_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.carp.validate()?;
        self.watchdog.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Settings for the coordination daemon.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarpConfig {
    /// Overrides the OS hostname used as this node's identity.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Address other nodes use to reach this one.
    #[serde(default)]
    pub advertise_address: String,
    /// Port the peer endpoint listens on across the fleet.
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    /// Local bind address for the peer endpoint.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Candidate addresses probed when looking for the current master.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default = "default_failover_after")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub failover_after: Duration,
    #[serde(default = "default_settle_window")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub settle_window: Duration,
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_carp_status_command")]
    pub carp_status_command: String,
}

impl Default for CarpConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            advertise_address: String::new(),
            peer_port: default_peer_port(),
            listen: default_listen(),
            peers: Vec::new(),
            failover_after: default_failover_after(),
            settle_window: default_settle_window(),
            poll_interval: default_poll_interval(),
            request_timeout: default_request_timeout(),
            socket_path: default_socket_path(),
            carp_status_command: default_carp_status_command(),
        }
    }
}

impl CarpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.settle_window < MIN_SETTLE_WINDOW {
            return Err(anyhow!(
                "carp.settle_window must be at least {}s (got {}s)",
                MIN_SETTLE_WINDOW.as_secs(),
                self.settle_window.as_secs()
            ));
        }
        let poll = self.poll_interval.as_secs();
        if !(1..=10).contains(&poll) {
            return Err(anyhow!(
                "carp.poll_interval must be between 1s and 10s (got {}s)",
                poll
            ));
        }
        if self.request_timeout.is_zero() || self.request_timeout > self.poll_interval {
            return Err(anyhow!(
                "carp.request_timeout must be non-zero and no longer than carp.poll_interval"
            ));
        }
        if self.failover_after.is_zero() {
            return Err(anyhow!("carp.failover_after must be non-zero"));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(anyhow!("carp.socket_path must not be empty"));
        }
        Ok(())
    }

    /// Effective node identity: the configured override or the OS hostname.
    pub fn effective_hostname(&self) -> String {
        match &self.hostname {
            Some(name) if !name.trim().is_empty() => name.trim().to_owned(),
            _ => gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }
}

/// Settings for the liveness watchdog process.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_check_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub check_interval: Duration,
    #[serde(default = "default_missed_threshold")]
    pub missed_threshold: u32,
    /// Suppresses the reboot. Never enabled implicitly.
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_fence_command")]
    pub fence_command: Vec<String>,
    #[serde(default = "default_reboot_command")]
    pub reboot_command: Vec<String>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            missed_threshold: default_missed_threshold(),
            debug: false,
            fence_command: default_fence_command(),
            reboot_command: default_reboot_command(),
            pid_file: None,
        }
    }
}

impl WatchdogConfig {
    pub const ENV_DEBUG: &str = "HOSTER_HA_DEBUG";

    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(anyhow!("watchdog.check_interval must be non-zero"));
        }
        if self.missed_threshold == 0 {
            return Err(anyhow!("watchdog.missed_threshold must be at least 1"));
        }
        if self.fence_command.is_empty() {
            return Err(anyhow!("watchdog.fence_command must name a program"));
        }
        if self.reboot_command.is_empty() {
            return Err(anyhow!("watchdog.reboot_command must name a program"));
        }
        Ok(())
    }

    /// Debug mode is on when configured or when `HOSTER_HA_DEBUG` is non-empty.
    pub fn debug_requested(&self) -> bool {
        self.debug
            || std::env::var(Self::ENV_DEBUG)
                .map(|value| !value.trim().is_empty())
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Exporter address of the coordination daemon.
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
    /// Exporter address of the watchdog process.
    #[serde(default = "default_watchdog_metrics_listen")]
    pub watchdog_listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
            watchdog_listen: default_watchdog_metrics_listen(),
        }
    }
}
