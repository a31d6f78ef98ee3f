//! Peer-to-peer connection lifecycle and path establishment.
//!
//! ```text
//!  Idle ──► Discovering ──► Connecting ──► Connected ──► Disconnected
//!    │           │               │              │
//!    └───────────┴───────┬───────┴──────────────┘
//!                        ▼
//!                      Error
//! ```
//!
//! `Disconnected` and `Error` are terminal; recovery negotiates a new
//! [`P2pConnection`].

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SkyError;
use crate::transport::nat::NatDetectionResult;

/// First bytes of a relay join.
pub const RELAY_MAGIC: &[u8; 4] = b"SKYR";

// ── P2pState ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum P2pState {
    #[default]
    Idle,
    Discovering,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for P2pState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            P2pState::Idle => "idle",
            P2pState::Discovering => "discovering",
            P2pState::Connecting => "connecting",
            P2pState::Connected => "connected",
            P2pState::Disconnected => "disconnected",
            P2pState::Error => "error",
        };
        f.write_str(s)
    }
}

impl P2pState {
    pub fn is_terminal(self) -> bool {
        matches!(self, P2pState::Disconnected | P2pState::Error)
    }
}

// ── Path description ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathKind {
    Direct,
    Relay,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKind::Direct => f.write_str("direct"),
            PathKind::Relay => f.write_str("relay"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    /// Local interface address.
    Host,
    /// Public address learned through STUN.
    ServerReflexive,
}

/// An address the remote peer may be reachable at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerCandidate {
    pub addr: SocketAddr,
    pub kind: CandidateKind,
}

impl PeerCandidate {
    pub fn host(addr: SocketAddr) -> Self {
        Self {
            addr,
            kind: CandidateKind::Host,
        }
    }

    pub fn reflexive(addr: SocketAddr) -> Self {
        Self {
            addr,
            kind: CandidateKind::ServerReflexive,
        }
    }
}

// ── P2pConnection ────────────────────────────────────────────────

#[derive(Debug)]
pub struct P2pConnection {
    pub id: Uuid,
    state: P2pState,
    pub remote_addr: Option<SocketAddr>,
    pub path: Option<PathKind>,
    pub nat: Option<NatDetectionResult>,
    created_at: Instant,
    connected_at: Option<Instant>,
}

impl P2pConnection {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            state: P2pState::Idle,
            remote_addr: None,
            path: None,
            nat: None,
            created_at: Instant::now(),
            connected_at: None,
        }
    }

    pub fn state(&self) -> P2pState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn connected_duration(&self) -> Option<Duration> {
        self.connected_at.map(|t| t.elapsed())
    }

    fn reject(&self, to: P2pState) -> SkyError {
        SkyError::InvalidTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Idle`.
    pub fn begin_discovery(&mut self) -> Result<(), SkyError> {
        match self.state {
            P2pState::Idle => {
                self.state = P2pState::Discovering;
                Ok(())
            }
            _ => Err(self.reject(P2pState::Discovering)),
        }
    }

    /// Valid from: `Discovering`.
    pub fn begin_connect(&mut self, nat: NatDetectionResult) -> Result<(), SkyError> {
        match self.state {
            P2pState::Discovering => {
                self.nat = Some(nat);
                self.state = P2pState::Connecting;
                Ok(())
            }
            _ => Err(self.reject(P2pState::Connecting)),
        }
    }

    /// Valid from: `Connecting`.
    pub fn complete(&mut self, remote: Option<SocketAddr>, path: PathKind) -> Result<(), SkyError> {
        match self.state {
            P2pState::Connecting => {
                self.state = P2pState::Connected;
                self.remote_addr = remote;
                self.path = Some(path);
                self.connected_at = Some(Instant::now());
                Ok(())
            }
            _ => Err(self.reject(P2pState::Connected)),
        }
    }

    /// Valid from: `Connected`.
    pub fn disconnect(&mut self) -> Result<(), SkyError> {
        match self.state {
            P2pState::Connected => {
                self.state = P2pState::Disconnected;
                Ok(())
            }
            _ => Err(self.reject(P2pState::Disconnected)),
        }
    }

    /// Valid from any non-terminal state.
    pub fn fail(&mut self) -> Result<(), SkyError> {
        if self.state.is_terminal() {
            return Err(self.reject(P2pState::Error));
        }
        self.state = P2pState::Error;
        Ok(())
    }
}

// ── Streams and connectors ───────────────────────────────────────

/// Any reliable byte stream a link can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the two kinds of path to a peer.
#[async_trait]
pub trait PathConnector: Send + Sync {
    async fn connect_direct(&self, candidate: &PeerCandidate) -> Result<BoxedStream, SkyError>;

    async fn connect_relay(&self, session_id: Uuid) -> Result<BoxedStream, SkyError>;
}

/// TCP connector: direct to the candidate, or through a relay that pairs
/// both sides by session id.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    relay: Option<SocketAddr>,
}

impl TcpConnector {
    pub fn new(relay: Option<SocketAddr>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl PathConnector for TcpConnector {
    async fn connect_direct(&self, candidate: &PeerCandidate) -> Result<BoxedStream, SkyError> {
        let stream = TcpStream::connect(candidate.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn connect_relay(&self, session_id: Uuid) -> Result<BoxedStream, SkyError> {
        let relay = self
            .relay
            .ok_or_else(|| SkyError::InvalidConfig("no relay server configured".into()))?;
        let mut stream = TcpStream::connect(relay).await?;
        stream.set_nodelay(true)?;
        let mut join = Vec::with_capacity(20);
        join.extend_from_slice(RELAY_MAGIC);
        join.extend_from_slice(session_id.as_bytes());
        stream.write_all(&join).await?;
        Ok(Box::new(stream))
    }
}

// ── Establishment ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraversalConfig {
    pub connection_timeout: Duration,
    pub max_retry_count: u32,
    /// Pause between rounds of attempts.
    pub retry_backoff: Duration,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            max_retry_count: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

pub struct Established {
    pub stream: BoxedStream,
    pub path: PathKind,
    pub remote: Option<SocketAddr>,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("path", &self.path)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Drive `conn` from `Connecting` to `Connected`.
///
/// Direct attempts are skipped outright for symmetric or unknown NAT.
/// Every attempt is bounded by `connection_timeout` and each path gets at
/// most `max_retry_count` rounds. On exhaustion `conn` moves to `Error`.
pub async fn establish(
    conn: &mut P2pConnection,
    candidates: &[PeerCandidate],
    connector: &dyn PathConnector,
    config: &TraversalConfig,
) -> Result<Established, SkyError> {
    let nat_type = conn
        .nat
        .as_ref()
        .map(|n| n.nat_type)
        .ok_or_else(|| SkyError::InvalidTransition {
            from: conn.state().to_string(),
            to: P2pState::Connected.to_string(),
        })?;
    let rounds = config.max_retry_count.max(1);
    let mut attempts = 0u32;
    let mut last_error = String::from("no path attempted");

    if nat_type.allows_direct() && !candidates.is_empty() {
        for round in 1..=rounds {
            for candidate in candidates {
                attempts += 1;
                match tokio::time::timeout(
                    config.connection_timeout,
                    connector.connect_direct(candidate),
                )
                .await
                {
                    Ok(Ok(stream)) => {
                        conn.complete(Some(candidate.addr), PathKind::Direct)?;
                        info!(connection = %conn.id, peer = %candidate.addr, "direct path established");
                        return Ok(Established {
                            stream,
                            path: PathKind::Direct,
                            remote: Some(candidate.addr),
                        });
                    }
                    Ok(Err(e)) => last_error = e.to_string(),
                    Err(_) => last_error = format!("timed out after {:?}", config.connection_timeout),
                }
                debug!(round, peer = %candidate.addr, error = %last_error, "direct attempt failed");
            }
            if round < rounds {
                tokio::time::sleep(config.retry_backoff).await;
            }
        }
        warn!(connection = %conn.id, attempts, "direct attempts exhausted, falling back to relay");
    } else {
        info!(connection = %conn.id, nat = %nat_type, "skipping direct attempts");
    }

    for round in 1..=rounds {
        attempts += 1;
        match tokio::time::timeout(config.connection_timeout, connector.connect_relay(conn.id)).await
        {
            Ok(Ok(stream)) => {
                conn.complete(None, PathKind::Relay)?;
                info!(connection = %conn.id, "relay path established");
                return Ok(Established {
                    stream,
                    path: PathKind::Relay,
                    remote: None,
                });
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {:?}", config.connection_timeout),
        }
        debug!(round, error = %last_error, "relay attempt failed");
        if round < rounds {
            tokio::time::sleep(config.retry_backoff).await;
        }
    }

    conn.fail()?;
    warn!(connection = %conn.id, attempts, error = %last_error, "all paths failed");
    Err(SkyError::ConnectionFailed {
        attempts,
        reason: last_error,
    })
}
