//! ---
//! ha_section: "05-networking-external-interfaces"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Local socket listener feeding registry updates."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hoster_ha_metrics::CoordinatorMetrics;
use hoster_ha_msg::{IpcMessage, MessageError, SocketResponse};
use hoster_ha_redundancy::FleetRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Largest single IPC message accepted.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;
/// Default bound on reading one message from a connection.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Failures of the IPC listener or of a single connection.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// A stale socket file could not be removed.
    #[error("failed to remove stale socket {path}: {source}")]
    Unlink {
        /// Socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The socket could not be bound.
    #[error("failed to bind ipc socket {path}: {source}")]
    Bind {
        /// Socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Connection-level I/O failure.
    #[error("ipc connection i/o failed: {0}")]
    Io(#[from] std::io::Error),
    /// The peer did not finish sending within the read timeout.
    #[error("ipc message not received within {0:?}")]
    Timeout(Duration),
    /// The message exceeded [`MAX_MESSAGE_BYTES`].
    #[error("ipc message exceeds {limit} bytes")]
    TooLarge {
        /// Configured limit.
        limit: usize,
    },
    /// The message could not be decoded.
    #[error(transparent)]
    Decode(#[from] MessageError),
    /// The acknowledgement could not be encoded.
    #[error("failed to encode ipc acknowledgement: {0}")]
    Encode(#[source] serde_json::Error),
}

/// What happened to one accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Applied to the registry and acknowledged.
    Applied(&'static str),
    /// Unrecognised discriminant; not applied, not acknowledged.
    Ignored(String),
}

/// Unix socket server through which the local API process feeds the registries.
///
/// One message per connection; each connection is handled on its own task.
#[derive(Debug)]
pub struct IpcListener {
    listener: UnixListener,
    path: PathBuf,
    registry: Arc<FleetRegistry>,
    metrics: Option<CoordinatorMetrics>,
    read_timeout: Duration,
}

impl IpcListener {
    /// Remove any stale socket at `path` and bind a fresh one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>, registry: Arc<FleetRegistry>) -> Result<Self, IpcError> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale ipc socket"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => return Err(IpcError::Unlink { path, source }),
        }
        let listener = UnixListener::bind(&path).map_err(|source| IpcError::Bind {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "ipc socket listening");
        Ok(Self {
            listener,
            path,
            registry,
            metrics: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }

    /// Count received messages per discriminant.
    pub fn with_metrics(mut self, metrics: CoordinatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override [`DEFAULT_READ_TIMEOUT`].
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Filesystem path of the bound socket.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` fires, finish the connections already
    /// accepted, then remove the socket file.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<()>) {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("ipc listener shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let registry = self.registry.clone();
                            let metrics = self.metrics.clone();
                            let timeout = self.read_timeout;
                            handlers.spawn(async move {
                                match handle_connection(stream, &registry, metrics.as_ref(), timeout).await {
                                    Ok(Dispatch::Applied(kind)) => debug!(kind, "ipc message applied"),
                                    Ok(Dispatch::Ignored(kind)) => warn!(kind = %kind, "unknown ipc message type ignored"),
                                    Err(err) => warn!(error = %err, "ipc connection dropped"),
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "ipc accept failed"),
                    }
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "ipc connection task failed");
                    }
                }
            }
        }
        // Bounded by the per-connection read timeout.
        if !handlers.is_empty() {
            debug!(in_flight = handlers.len(), "waiting for in-flight ipc connections");
        }
        while let Some(joined) = handlers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "ipc connection task failed");
            }
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(error = %err, path = %self.path.display(), "failed to remove ipc socket");
            }
        }
    }
}

/// Read one message, apply it, and acknowledge recognised types.
pub async fn handle_connection(
    mut stream: UnixStream,
    registry: &FleetRegistry,
    metrics: Option<&CoordinatorMetrics>,
    read_timeout: Duration,
) -> Result<Dispatch, IpcError> {
    let bytes = tokio::time::timeout(read_timeout, read_message(&mut stream))
        .await
        .map_err(|_| IpcError::Timeout(read_timeout))??;
    let message = IpcMessage::decode(&bytes)?;
    if let Some(metrics) = metrics {
        metrics.record_ipc_message(message.kind());
    }
    let dispatch = match message {
        IpcMessage::HostAdd(host) => {
            registry.add_host(host);
            if let Some(metrics) = metrics {
                metrics.set_hosts_known(registry.host_count());
            }
            Dispatch::Applied(hoster_ha_msg::HOST_ADD)
        }
        IpcMessage::BackupAdd(backup) => {
            registry.add_backup(backup);
            Dispatch::Applied(hoster_ha_msg::BACKUP_ADD)
        }
        IpcMessage::Unknown(kind) => return Ok(Dispatch::Ignored(kind)),
    };
    let ack = serde_json::to_vec(&SocketResponse::OK).map_err(IpcError::Encode)?;
    stream.write_all(&ack).await?;
    stream.shutdown().await?;
    Ok(dispatch)
}

/// Read until the buffer holds one complete JSON value or the writer closes.
async fn read_message(stream: &mut UnixStream) -> Result<Vec<u8>, IpcError> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(buffer);
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > MAX_MESSAGE_BYTES {
            return Err(IpcError::TooLarge {
                limit: MAX_MESSAGE_BYTES,
            });
        }
        if serde_json::from_slice::<serde::de::IgnoredAny>(&buffer).is_ok() {
            return Ok(buffer);
        }
    }
}
