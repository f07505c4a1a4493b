//! ---
//! ha_section: "05-networking-external-interfaces"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "Outbound peer protocol client."
//! ha_version: "v0.0.0-prealpha"
//! ha_owner: "tbd"
//! ---
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hoster_ha_msg::{BackupRecord, PingRequest, PingResponse, StatePush};
use reqwest::{Client, StatusCode};
use tracing::debug;

/// Route prefix shared by every peer endpoint.
pub const API_PREFIX: &str = "/api/v2/ha";
/// Push-receive route.
pub const RECEIVE_STATE_PATH: &str = "/api/v2/ha/receive-state";
/// Liveness probe route.
pub const PING_PATH: &str = "/api/v2/ha/ping";
/// Backup inventory route.
pub const BACKUPS_PATH: &str = "/api/v2/ha/backups";
/// Operator status route.
pub const STATUS_PATH: &str = "/api/v2/ha/status";

/// Failure talking to a single peer. Always transient from the caller's view.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// The HTTP client itself could not be constructed.
    #[error("failed to build peer http client: {0}")]
    Client(#[source] reqwest::Error),
    /// The peer did not answer within the configured timeout.
    #[error("peer {peer} did not answer within {timeout:?}")]
    Timeout {
        /// Address of the peer.
        peer: String,
        /// Configured bound.
        timeout: Duration,
    },
    /// Connection or transfer failure.
    #[error("request to peer {peer} failed: {source}")]
    Request {
        /// Address of the peer.
        peer: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// The peer answered with a non-success status.
    #[error("peer {peer} answered {status}")]
    Status {
        /// Address of the peer.
        peer: String,
        /// HTTP status returned.
        status: StatusCode,
    },
    /// The peer answered with a body that could not be decoded.
    #[error("peer {peer} returned an undecodable body: {source}")]
    Decode {
        /// Address of the peer.
        peer: String,
        /// Underlying decode error.
        #[source]
        source: reqwest::Error,
    },
}

/// Outbound side of the peer protocols.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Deliver a full registry snapshot to `address`.
    async fn push_state(&self, address: &str, push: &StatePush) -> Result<(), PeerError>;

    /// Pull the backup inventory held by `address`.
    async fn fetch_backups(&self, address: &str) -> Result<Vec<BackupRecord>, PeerError>;

    /// Probe `address` for liveness and role.
    async fn ping(&self, address: &str, request: &PingRequest) -> Result<PingResponse, PeerError>;
}

/// [`PeerTransport`] over HTTP/JSON with a hard per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: Client,
    port: u16,
    timeout: Duration,
}

impl HttpPeerClient {
    /// Build a client that reaches peers on `port` and gives up after `timeout`.
    pub fn new(port: u16, timeout: Duration) -> Result<Self, PeerError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(PeerError::Client)?;
        Ok(Self {
            client,
            port,
            timeout,
        })
    }

    /// Base URL for a peer given as a bare host, an IP or a `host:port` pair.
    pub fn base_url(&self, address: &str) -> String {
        if address.parse::<SocketAddr>().is_ok() {
            return format!("http://{address}");
        }
        match address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("http://[{ip}]:{}", self.port),
            _ => format!("http://{address}:{}", self.port),
        }
    }

    fn request_error(&self, peer: &str, source: reqwest::Error) -> PeerError {
        if source.is_timeout() {
            PeerError::Timeout {
                peer: peer.to_owned(),
                timeout: self.timeout,
            }
        } else {
            PeerError::Request {
                peer: peer.to_owned(),
                source,
            }
        }
    }

    async fn send(
        &self,
        peer: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PeerError> {
        let response = request
            .send()
            .await
            .map_err(|err| self.request_error(peer, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PeerError::Status {
                peer: peer.to_owned(),
                status,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl PeerTransport for HttpPeerClient {
    async fn push_state(&self, address: &str, push: &StatePush) -> Result<(), PeerError> {
        let url = format!("{}{}", self.base_url(address), RECEIVE_STATE_PATH);
        self.send(address, self.client.post(url).json(push)).await?;
        debug!(peer = address, hosts = push.hosts.len(), "state pushed");
        Ok(())
    }

    async fn fetch_backups(&self, address: &str) -> Result<Vec<BackupRecord>, PeerError> {
        let url = format!("{}{}", self.base_url(address), BACKUPS_PATH);
        let response = self.send(address, self.client.get(url)).await?;
        response.json().await.map_err(|source| {
            if source.is_timeout() {
                self.request_error(address, source)
            } else {
                PeerError::Decode {
                    peer: address.to_owned(),
                    source,
                }
            }
        })
    }

    async fn ping(&self, address: &str, request: &PingRequest) -> Result<PingResponse, PeerError> {
        let url = format!("{}{}", self.base_url(address), PING_PATH);
        let response = self
            .send(address, self.client.post(url).json(request))
            .await?;
        response.json().await.map_err(|source| PeerError::Decode {
            peer: address.to_owned(),
            source,
        })
    }
}
