//! Host service: wires the concrete collaborators into a
//! [`ControlServer`] and runs it until stopped.
//!
//! ```text
//!  HostConfig ──► ServerConfig ─┐
//!  UdpAnnouncer ────────────────┤
//!  AllowListAuthorizer ─────────┼──► ControlServer ──► SessionEvent log
//!  platform input injector ─────┤
//!  capture source + backend ────┘
//! ```
//!
//! The backend is the zstd raw-image codec; no hardware codec is linked
//! into this build, so only `RAW_IMAGE` is advertised.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use skylink_core::capture::CaptureSource;
use skylink_core::encoder::RawImageBackend;
use skylink_core::session::{
    Collaborators, ControlServer, ServiceAdvertiser, ServiceRecord, SessionEvent, SessionState,
    SourceFactory, UdpAnnouncer, platform_injector,
};
use skylink_core::transport::{PeerCandidate, TcpConnector, UdpStunProber};
use skylink_core::SkyError;

use crate::config::HostConfig;

// ── HostService ──────────────────────────────────────────────────

pub struct HostService {
    config: HostConfig,
    stop: CancellationToken,
}

impl HostService {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            stop: CancellationToken::new(),
        }
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }

    /// Build the server from configuration without starting it.
    pub fn build_server(&self) -> Result<ControlServer, SkyError> {
        let server_config = self.config.to_server_config()?;
        let advertiser: Arc<dyn ServiceAdvertiser> = if self.config.network.advertise {
            Arc::new(UdpAnnouncer::new(self.config.network.discovery_port))
        } else {
            Arc::new(NoAdvertiser)
        };
        let collab = Collaborators {
            authorizer: Arc::new(self.config.authorizer()),
            injector: platform_injector(),
            advertiser,
            capture: capture_factory(&self.config),
            backend: Arc::new(RawImageBackend),
        };
        Ok(ControlServer::new(server_config, collab))
    }

    /// Serve until the stop handle is cancelled. When `connect` is set the
    /// host also dials out to that viewer.
    pub async fn run(&self, connect: Option<SocketAddr>) -> Result<(), SkyError> {
        let security = &self.config.security;
        if !security.allow_any
            && security.allowed_devices.is_empty()
            && security.allowed_fingerprints.is_empty()
        {
            warn!("no peers are allowed; every inbound connection will be refused");
        }

        let server = self.build_server()?;
        let events = server.subscribe();
        let log_task = tokio::spawn(log_events(events, self.stop.clone()));

        let local = server.start(self.config.network.control_port).await?;
        info!(%local, device = %server.identity().device_id, "host ready");

        if let Some(viewer) = connect {
            self.dial(&server, viewer).await;
        }

        self.stop.cancelled().await;
        info!("stopping host");
        server.stop().await;
        log_task.abort();
        info!("host stopped");
        Ok(())
    }

    async fn dial(&self, server: &ControlServer, viewer: SocketAddr) {
        let Some(stun) = first_stun_server(&self.config) else {
            warn!("no STUN server to classify the NAT with; skipping dial");
            return;
        };
        let prober = match UdpStunProber::bind(&stun).await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "cannot open STUN socket");
                return;
            }
        };
        let connector = TcpConnector::new(self.config.traversal.relay);
        match server
            .dial(&[PeerCandidate::host(viewer)], &connector, &prober)
            .await
        {
            Ok(session) => info!(session = %session.id(), %viewer, "outbound session started"),
            Err(e) => error!(%viewer, error = %e, "outbound connection failed"),
        }
    }
}

fn first_stun_server(config: &HostConfig) -> Option<skylink_core::transport::StunServer> {
    config
        .traversal
        .stun_servers
        .first()
        .and_then(|s| s.parse().ok())
}

/// DXGI duplication on Windows, the synthetic test pattern elsewhere.
fn capture_factory(config: &HostConfig) -> SourceFactory {
    #[cfg(target_os = "windows")]
    {
        let monitor = config.screen.monitor_index;
        Arc::new(move || {
            Box::new(skylink_core::capture::DxgiSource::new(monitor)) as Box<dyn CaptureSource>
        })
    }
    #[cfg(not(target_os = "windows"))]
    {
        let resolution =
            skylink_core::capture::Resolution::new(config.screen.width, config.screen.height);
        Arc::new(move || {
            Box::new(skylink_core::capture::SyntheticSource::new(resolution))
                as Box<dyn CaptureSource>
        })
    }
}

/// Advertiser used when discovery is switched off.
struct NoAdvertiser;

#[async_trait::async_trait]
impl ServiceAdvertiser for NoAdvertiser {
    async fn publish(&self, _: &ServiceRecord) -> Result<(), SkyError> {
        Ok(())
    }

    async fn update(&self, _: &ServiceRecord) -> Result<(), SkyError> {
        Ok(())
    }

    async fn withdraw(&self) -> Result<(), SkyError> {
        Ok(())
    }
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>, stop: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            e = events.recv() => e,
        };
        match event {
            Ok(SessionEvent::StateChanged {
                session_id,
                state: SessionState::Failed(reason),
            }) => warn!(session = %session_id, %reason, "session failed"),
            Ok(SessionEvent::QualityChanged {
                session_id,
                level,
                stability,
            }) => info!(session = %session_id, %level, stability, "connection quality"),
            Ok(SessionEvent::EncodingChanged {
                session_id,
                codec,
                config,
            }) => info!(
                session = %session_id,
                ?codec,
                bitrate = config.bitrate_bps,
                fps = config.frame_rate,
                resolution = %config.resolution,
                "encoding"
            ),
            Ok(SessionEvent::HandshakeFailed { peer, reason }) => {
                warn!(%peer, %reason, "handshake failed")
            }
            Ok(SessionEvent::Error {
                session_id,
                message,
            }) => error!(session = ?session_id, %message, "session error"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "event log lagging"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
