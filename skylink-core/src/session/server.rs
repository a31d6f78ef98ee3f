//! Control server: listener, advertisement, handshake and the active
//! session.
//!
//! ```text
//!  viewer                         ControlServer
//!    │ ── TCP connect ──────────────► accept_loop
//!    │ ── Hello{identity, caps, A} ──► authorize (PeerAuthorizer)
//!    │ ◄─ HelloAck{accepted, id, B} ──  install session keys
//!    │ ◄═ sealed video ════════════════ SessionHandle (capture → encode → link)
//!    │ ══ sealed input ════════════════► InputInjector
//! ```
//!
//! One session is active at a time; a Hello that arrives while another
//! session is live is refused as busy. The accepted HelloAck is the last
//! plaintext frame and is queued before the session starts.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::CaptureSource;
use crate::crypto::{KeyExchange, Role};
use crate::encoder::{CodecProfile, CompressionBackend};
use crate::error::{FailureReason, SkyError};
use crate::packet::Packet;
use crate::protocol::{Capabilities, ControlMessage, Message, PeerIdentity};
use crate::session::collab::{AuthDecision, InputInjector, PeerAuthorizer};
use crate::session::discovery::{ServiceAdvertiser, ServiceRecord};
use crate::session::handle::{SessionConfig, SessionHandle, SessionParts};
use crate::session::state::{SessionEvent, SessionStatus};
use crate::transport::{
    Link, LinkSender, NatCache, NatClassifier, NatDetectionConfig, P2pConnection, PathConnector,
    PathKind, PeerCandidate, StunProber, StunServer, TraversalConfig, establish,
};

pub const DEFAULT_CONTROL_PORT: u16 = 5901;

/// Builds a fresh capture source for each session.
pub type SourceFactory = Arc<dyn Fn() -> Box<dyn CaptureSource> + Send + Sync>;

// ── Identity ─────────────────────────────────────────────────────

/// How this host describes itself in Hello messages and advertisements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub device_id: Uuid,
    pub name: String,
    pub platform: String,
    pub os_version: String,
    pub model: String,
    pub pub_key_fp: Option<String>,
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self {
            device_id: Uuid::new_v4(),
            name: "skylink".into(),
            platform: std::env::consts::OS.into(),
            os_version: String::new(),
            model: std::env::consts::ARCH.into(),
            pub_key_fp: None,
        }
    }
}

impl LocalIdentity {
    pub fn peer_identity(&self) -> PeerIdentity {
        PeerIdentity {
            device_id: self.device_id,
            name: self.name.clone(),
            platform: self.platform.clone(),
            pub_key_fp: self.pub_key_fp.clone(),
        }
    }

    pub fn service_record(&self, port: u16, capabilities: Capabilities) -> ServiceRecord {
        ServiceRecord {
            name: self.name.clone(),
            platform: self.platform.clone(),
            os_version: self.os_version.clone(),
            model: self.model.clone(),
            capabilities: capabilities.names().into_iter().map(String::from).collect(),
            remote_port: port,
            device_id: self.device_id,
            pub_key_fp: self.pub_key_fp.clone(),
        }
    }
}

/// Hex of the first 16 bytes of the blake3 hash of `pub_key`.
pub fn key_fingerprint(pub_key: &[u8]) -> String {
    let hash = blake3::hash(pub_key);
    hash.as_bytes()[..16]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Pick the codec for a session given what both ends support.
///
/// HEVC requests degrade to H.264 High for peers without HEVC, and to
/// the raw-image codec for peers with neither hardware codec.
pub fn select_codec(requested: CodecProfile, negotiated: Capabilities) -> Option<CodecProfile> {
    let hevc = negotiated.contains(Capabilities::HEVC);
    let h264 = negotiated.contains(Capabilities::H264);
    let raw = negotiated.contains(Capabilities::RAW_IMAGE);
    match requested {
        CodecProfile::HevcMain | CodecProfile::Auto if hevc => Some(requested),
        CodecProfile::HevcMain | CodecProfile::Auto if h264 => Some(CodecProfile::H264High),
        CodecProfile::H264Baseline | CodecProfile::H264Main | CodecProfile::H264High if h264 => {
            Some(requested)
        }
        _ if raw => Some(CodecProfile::RawImage),
        _ => None,
    }
}

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub identity: LocalIdentity,
    pub capabilities: Capabilities,
    /// Time a new connection has to present its Hello (and a dialled
    /// peer its HelloAck).
    pub handshake_timeout: Duration,
    /// Refuse peers that do not offer a key share.
    pub require_encryption: bool,
    pub session: SessionConfig,
    pub traversal: TraversalConfig,
    pub nat: NatDetectionConfig,
    pub stun_servers: Vec<StunServer>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            identity: LocalIdentity::default(),
            capabilities: Capabilities::default(),
            handshake_timeout: Duration::from_secs(10),
            require_encryption: true,
            session: SessionConfig::default(),
            traversal: TraversalConfig::default(),
            nat: NatDetectionConfig::default(),
            stun_servers: StunServer::defaults(),
        }
    }
}

/// External collaborators the server delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub authorizer: Arc<dyn PeerAuthorizer>,
    pub injector: Arc<dyn InputInjector>,
    pub advertiser: Arc<dyn ServiceAdvertiser>,
    pub capture: SourceFactory,
    pub backend: Arc<dyn CompressionBackend>,
}

// ── ControlServer ────────────────────────────────────────────────

struct Listening {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local: SocketAddr,
}

struct Inner {
    config: ServerConfig,
    identity: Mutex<LocalIdentity>,
    /// Record currently published, if listening.
    advert: Mutex<Option<ServiceRecord>>,
    collab: Collaborators,
    events: broadcast::Sender<SessionEvent>,
    listener: tokio::sync::Mutex<Option<Listening>>,
    active: tokio::sync::Mutex<Option<Arc<SessionHandle>>>,
    nat_cache: NatCache,
}

/// Accepts peers, owns the active session and publishes status events.
#[derive(Clone)]
pub struct ControlServer {
    inner: Arc<Inner>,
}

impl ControlServer {
    pub fn new(config: ServerConfig, collab: Collaborators) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                identity: Mutex::new(config.identity.clone()),
                config,
                advert: Mutex::new(None),
                collab,
                events,
                listener: tokio::sync::Mutex::new(None),
                active: tokio::sync::Mutex::new(None),
                nat_cache: NatCache::new(),
            }),
        }
    }

    /// Status events for every session of this server.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn identity(&self) -> LocalIdentity {
        self.inner.identity()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().await.as_ref().map(|l| l.local)
    }

    pub async fn active_session(&self) -> Option<Arc<SessionHandle>> {
        self.inner.active.lock().await.clone()
    }

    pub async fn nat_cache_invalidate(&self) {
        self.inner.nat_cache.invalidate().await;
    }

    /// Bind the listener and publish the advertisement.
    ///
    /// Port 0 binds an ephemeral port; the bound address is returned.
    /// Calling `start` while already listening returns the current address.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, SkyError> {
        let mut slot = self.inner.listener.lock().await;
        if let Some(l) = slot.as_ref() {
            return Ok(l.local);
        }
        let listener = TcpListener::bind(SocketAddr::new(self.inner.config.bind_ip, port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => SkyError::PortUnavailable(port),
                _ => SkyError::Connection(e),
            })?;
        let local = listener.local_addr()?;

        let record = self
            .inner
            .identity()
            .service_record(local.port(), self.inner.config.capabilities);
        if let Err(e) = self.inner.collab.advertiser.publish(&record).await {
            warn!(error = %e, "service advertisement failed, continuing without it");
        }
        *self.inner.advert.lock().unwrap_or_else(PoisonError::into_inner) = Some(record);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            Arc::clone(&self.inner),
            listener,
            cancel.clone(),
        ));
        info!(%local, "control server listening");
        *slot = Some(Listening {
            cancel,
            task,
            local,
        });
        Ok(local)
    }

    /// Stop listening, withdraw the advertisement and end the active
    /// session. Idempotent.
    pub async fn stop(&self) {
        let listening = self.inner.listener.lock().await.take();
        if let Some(l) = listening {
            l.cancel.cancel();
            if let Err(e) = l.task.await {
                warn!(error = %e, "accept loop ended abnormally");
            }
            self.inner
                .advert
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Err(e) = self.inner.collab.advertiser.withdraw().await {
                warn!(error = %e, "failed to withdraw advertisement");
            }
            info!(local = %l.local, "control server stopped");
        }
        let active = self.inner.active.lock().await.take();
        if let Some(session) = active {
            session.stop().await;
        }
    }

    /// Install the key fingerprint for `pub_key` and refresh the
    /// advertisement in the background. Returns the fingerprint.
    pub fn set_identity(&self, pub_key: &[u8]) -> String {
        let fp = key_fingerprint(pub_key);
        self.inner
            .identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pub_key_fp = Some(fp.clone());

        let updated = {
            let mut advert = self.inner.advert.lock().unwrap_or_else(PoisonError::into_inner);
            advert.as_mut().map(|record| {
                record.pub_key_fp = Some(fp.clone());
                record.clone()
            })
        };
        if let Some(record) = updated {
            let advertiser = Arc::clone(&self.inner.collab.advertiser);
            tokio::spawn(async move {
                if let Err(e) = advertiser.update(&record).await {
                    warn!(error = %e, "advertisement update failed");
                }
            });
        }
        info!(fingerprint = %fp, "identity key installed");
        fp
    }

    /// Connect out to a peer: classify the local NAT (cached), establish
    /// a direct or relayed path, run the initiator handshake and start
    /// streaming.
    pub async fn dial(
        &self,
        candidates: &[PeerCandidate],
        connector: &dyn PathConnector,
        prober: &dyn StunProber,
    ) -> Result<Arc<SessionHandle>, SkyError> {
        let inner = &self.inner;
        let classifier = NatClassifier::new(inner.config.stun_servers.clone(), inner.config.nat);
        let nat = inner.nat_cache.get_or_detect(&classifier, prober).await;

        let mut conn = P2pConnection::new(Uuid::new_v4());
        conn.begin_discovery()?;
        conn.begin_connect(nat)?;
        let established = establish(&mut conn, candidates, connector, &inner.config.traversal).await?;
        let path = established.path;
        let remote = established.remote;
        let (link, mut inbound) = Link::new(established.stream, inner.config.session.link).into_split();

        let kx = KeyExchange::new();
        let hello = ControlMessage::Hello {
            identity: inner.identity().peer_identity(),
            capabilities: inner.config.capabilities,
            key_share: Some(kx.key_share().to_vec()),
        };
        link.send_control(hello)?;
        let reply = recv_control(&mut inbound, inner.config.handshake_timeout).await;
        let (session_id, remote_caps, peer_share) = match reply {
            Ok(ControlMessage::HelloAck {
                accepted: true,
                session_id,
                capabilities,
                key_share,
                ..
            }) => (session_id.unwrap_or_else(Uuid::new_v4), capabilities, key_share),
            Ok(ControlMessage::HelloAck { reason, .. }) => {
                let reason = reason.unwrap_or_else(|| "refused".into());
                return Err(inner
                    .abandon(&link, &mut conn, SkyError::Unauthorized(reason))
                    .await);
            }
            Ok(other) => {
                let e = SkyError::ProtocolViolation(format!("expected HelloAck, got {other:?}"));
                return Err(inner.abandon(&link, &mut conn, e).await);
            }
            Err(e) => return Err(inner.abandon(&link, &mut conn, e).await),
        };

        match peer_share {
            Some(share) => {
                if let Err(e) = kx
                    .agree(Role::Initiator, &share)
                    .and_then(|keys| link.install_keys(keys, None))
                {
                    return Err(inner.abandon(&link, &mut conn, e).await);
                }
            }
            None if inner.config.require_encryption => {
                let e = SkyError::Crypto("peer did not offer a key share".into());
                return Err(inner.abandon(&link, &mut conn, e).await);
            }
            None => warn!(session = %session_id, "peer declined encryption, streaming in clear"),
        }
        let config = match inner.session_config(remote_caps) {
            Ok(config) => config,
            Err(e) => return Err(inner.abandon(&link, &mut conn, e).await),
        };

        // The remote peer is the viewer; its identity is whatever it
        // advertised, which the Ack does not carry.
        let peer = PeerIdentity {
            device_id: Uuid::nil(),
            name: remote.map(|a| a.to_string()).unwrap_or_else(|| "relay".into()),
            platform: String::new(),
            pub_key_fp: None,
        };
        let mut active = inner.active.lock().await;
        if active.as_ref().is_some_and(|s| !s.is_finished()) {
            let e = SkyError::Other("another session is active".into());
            return Err(inner.abandon(&link, &mut conn, e).await);
        }
        let session = inner
            .launch(config, session_id, peer, remote, path, link, inbound)
            .inspect_err(|_| {
                let _ = conn.fail();
            })?;
        *active = Some(Arc::clone(&session));
        Ok(session)
    }
}

impl Inner {
    fn identity(&self) -> LocalIdentity {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn abandon(&self, link: &LinkSender, conn: &mut P2pConnection, e: SkyError) -> SkyError {
        warn!(error = %e, "outbound handshake failed");
        link.close(&e.to_string(), self.config.session.teardown_timeout)
            .await;
        if let Err(t) = conn.fail() {
            debug!(error = %t, "connection already terminal");
        }
        e
    }

    /// Session settings narrowed to what the peer supports.
    fn session_config(&self, negotiated: Capabilities) -> Result<SessionConfig, SkyError> {
        let mut config = self.config.session;
        let codec = select_codec(config.pipeline.encoding.codec, negotiated)
            .ok_or_else(|| SkyError::EncoderUnavailable("no codec in common with peer".into()))?;
        if codec != config.pipeline.encoding.codec {
            info!(requested = %config.pipeline.encoding.codec, %codec, "codec adjusted to peer");
        }
        config.pipeline.encoding.codec = codec;
        config.pipeline.encoder.software_fallback &= negotiated.contains(Capabilities::RAW_IMAGE);
        Ok(config)
    }

    /// Start a session over a link whose handshake is complete.
    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        config: SessionConfig,
        id: Uuid,
        peer: PeerIdentity,
        remote_addr: Option<SocketAddr>,
        path: PathKind,
        link: LinkSender,
        inbound: mpsc::Receiver<Packet>,
    ) -> Result<Arc<SessionHandle>, SkyError> {
        let status = Arc::new(SessionStatus::new(id, self.events.clone()));
        let parts = SessionParts {
            id,
            peer,
            remote_addr,
            path,
            link,
            inbound,
            source: (self.collab.capture)(),
            backend: Arc::clone(&self.collab.backend),
            injector: Arc::clone(&self.collab.injector),
        };
        SessionHandle::spawn(parts, config, status).map(Arc::new)
    }
}

// ── Accept path ──────────────────────────────────────────────────

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            r = listener.accept() => match r {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        debug!(%addr, "inbound connection");
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "set_nodelay failed");
        }
        tokio::spawn(handle_inbound(Arc::clone(&inner), stream, addr, cancel.clone()));
    }
}

async fn handle_inbound(
    inner: Arc<Inner>,
    stream: TcpStream,
    addr: SocketAddr,
    cancel: CancellationToken,
) {
    let (link, mut inbound) = Link::new(stream, inner.config.session.link).into_split();
    let timeout = inner.config.handshake_timeout;

    let (identity, capabilities, peer_share) = match recv_control(&mut inbound, timeout).await {
        Ok(ControlMessage::Hello {
            identity,
            capabilities,
            key_share,
        }) => (identity, capabilities, key_share),
        Ok(other) => {
            let e = SkyError::ProtocolViolation(format!("expected Hello, got {other:?}"));
            return reject(&inner, &link, addr, None, e).await;
        }
        Err(e) => return reject(&inner, &link, addr, None, e).await,
    };

    // Held across authorization so two Hellos cannot both win the slot.
    let mut active = inner.active.lock().await;
    if cancel.is_cancelled() {
        let e = SkyError::Other("server stopping".into());
        return reject(&inner, &link, addr, Some("server stopping".into()), e).await;
    }
    if active.as_ref().is_some_and(|s| !s.is_finished()) {
        info!(%addr, peer = %identity.name, "refusing peer: session already active");
        send_refusal(&link, "busy".into());
        link.close("busy", inner.config.session.teardown_timeout).await;
        return;
    }
    if let AuthDecision::Deny(reason) = inner.collab.authorizer.authorize(&identity, Some(addr)).await {
        let e = SkyError::Unauthorized(reason.clone());
        return reject(&inner, &link, addr, Some(reason), e).await;
    }

    let negotiated = inner.config.capabilities.negotiate(capabilities);
    let config = match inner.session_config(negotiated) {
        Ok(config) => config,
        Err(e) => return reject(&inner, &link, addr, Some(e.to_string()), e).await,
    };
    let keys = match peer_share {
        Some(share) => {
            let kx = KeyExchange::new();
            let local_share = kx.key_share().to_vec();
            match kx.agree(Role::Responder, &share) {
                Ok(keys) => Some((keys, local_share)),
                Err(e) => return reject(&inner, &link, addr, Some(e.to_string()), e).await,
            }
        }
        None if inner.config.require_encryption => {
            let e = SkyError::Unauthorized("encryption required".into());
            return reject(&inner, &link, addr, Some("encryption required".into()), e).await;
        }
        None => {
            warn!(%addr, "peer declined encryption, streaming in clear");
            None
        }
    };

    let id = Uuid::new_v4();
    info!(%addr, peer = %identity.name, device = %identity.device_id, caps = ?negotiated.names(), sealed = keys.is_some(), "peer authorized");
    let ack = |key_share| ControlMessage::HelloAck {
        accepted: true,
        session_id: Some(id),
        capabilities: negotiated,
        reason: None,
        key_share,
    };
    // The ack goes out before any session traffic can be queued.
    let queued = match keys {
        Some((keys, local_share)) => link.install_keys(keys, Some(ack(Some(local_share)))),
        None => link.send_control(ack(None)),
    };
    if let Err(e) = queued {
        return reject(&inner, &link, addr, None, e).await;
    }
    match inner.launch(config, id, identity, Some(addr), PathKind::Direct, link.clone(), inbound) {
        Ok(session) => *active = Some(session),
        Err(e) => reject(&inner, &link, addr, None, e).await,
    }
}

fn send_refusal(link: &LinkSender, reason: String) {
    let ack = ControlMessage::HelloAck {
        accepted: false,
        session_id: None,
        capabilities: Capabilities::empty(),
        reason: Some(reason),
        key_share: None,
    };
    if let Err(e) = link.send_control(ack) {
        debug!(error = %e, "HelloAck not queued");
    }
}

/// Refuse a connection, tell the peer why when it got that far, and
/// publish the failure.
async fn reject(
    inner: &Inner,
    link: &LinkSender,
    addr: SocketAddr,
    ack_reason: Option<String>,
    e: SkyError,
) {
    let reason = FailureReason::from_error(&e);
    warn!(%addr, error = %e, %reason, "handshake failed");
    if let Some(r) = ack_reason {
        send_refusal(link, r);
    }
    link.close(&e.to_string(), inner.config.session.teardown_timeout)
        .await;
    inner.emit(SessionEvent::HandshakeFailed { peer: addr, reason });
}

/// First non-liveness control message, within `timeout`.
async fn recv_control(
    inbound: &mut mpsc::Receiver<Packet>,
    timeout: Duration,
) -> Result<ControlMessage, SkyError> {
    let packet = tokio::time::timeout(timeout, inbound.recv())
        .await
        .map_err(|_| SkyError::Timeout(timeout))?
        .ok_or_else(|| SkyError::ConnectionFailed {
            attempts: 1,
            reason: "peer closed during handshake".into(),
        })?;
    match Message::decode(&packet)? {
        Message::Control(msg) => Ok(msg),
        other => Err(SkyError::ProtocolViolation(format!(
            "expected control message, got {}",
            match other {
                Message::Video(_) => "video",
                Message::Input(_) => "input",
                Message::Control(_) => "control",
            }
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Resolution, SyntheticSource};
    use crate::encoder::SimulatedBackend;
    use crate::session::collab::{AllowListAuthorizer, LoggingInjector, MockPeerAuthorizer};
    use crate::session::discovery::UdpAnnouncer;
    use crate::transport::LinkConfig;

    fn collab(authorizer: Arc<dyn PeerAuthorizer>) -> (Collaborators, Arc<UdpAnnouncer>) {
        let announcer = Arc::new(UdpAnnouncer::bind_to("127.0.0.1:0".parse().unwrap()));
        let collab = Collaborators {
            authorizer,
            injector: Arc::new(LoggingInjector::new()),
            advertiser: announcer.clone(),
            capture: Arc::new(|| Box::new(SyntheticSource::new(Resolution::new(64, 32)))),
            backend: Arc::new(SimulatedBackend::new()),
        };
        (collab, announcer)
    }

    fn config() -> ServerConfig {
        let mut cfg = ServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            handshake_timeout: Duration::from_millis(300),
            ..ServerConfig::default()
        };
        cfg.session.pipeline.capture.resolution = Resolution::new(64, 32);
        cfg.session.pipeline.encoding.resolution = Resolution::new(64, 32);
        cfg
    }

    fn viewer_hello_with(key_share: Option<Vec<u8>>) -> ControlMessage {
        ControlMessage::Hello {
            identity: PeerIdentity {
                device_id: Uuid::new_v4(),
                name: "viewer".into(),
                platform: "macos".into(),
                pub_key_fp: None,
            },
            capabilities: Capabilities::H264 | Capabilities::SCREEN_CAPTURE,
            key_share,
        }
    }

    fn viewer_hello() -> ControlMessage {
        viewer_hello_with(Some(KeyExchange::new().key_share().to_vec()))
    }

    #[test]
    fn fingerprint_is_16_bytes_hex() {
        let fp = key_fingerprint(b"public key bytes");
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, key_fingerprint(b"public key bytes"));
    }

    #[test]
    fn codec_follows_peer_capabilities() {
        let all = Capabilities::default();
        assert_eq!(select_codec(CodecProfile::HevcMain, all), Some(CodecProfile::HevcMain));
        assert_eq!(
            select_codec(CodecProfile::HevcMain, Capabilities::H264),
            Some(CodecProfile::H264High)
        );
        assert_eq!(
            select_codec(CodecProfile::H264Main, Capabilities::H264),
            Some(CodecProfile::H264Main)
        );
        assert_eq!(
            select_codec(CodecProfile::Auto, Capabilities::RAW_IMAGE),
            Some(CodecProfile::RawImage)
        );
        assert_eq!(select_codec(CodecProfile::H264High, Capabilities::HEVC), None);
    }

    #[tokio::test]
    async fn port_in_use_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let (collab, _) = collab(Arc::new(AllowListAuthorizer::allow_any()));
        let server = ControlServer::new(config(), collab);
        assert!(matches!(
            server.start(port).await,
            Err(SkyError::PortUnavailable(p)) if p == port
        ));
    }

    #[tokio::test]
    async fn start_publishes_and_stop_is_idempotent() {
        let (collab, announcer) = collab(Arc::new(AllowListAuthorizer::allow_any()));
        let server = ControlServer::new(config(), collab);
        let addr = server.start(0).await.unwrap();
        assert_eq!(server.start(0).await.unwrap(), addr);
        let record = announcer.record().unwrap();
        assert_eq!(record.remote_port, addr.port());
        assert!(record.capabilities.iter().any(|c| c == "h264"));

        let fp = server.set_identity(b"key");
        assert_eq!(server.identity().pub_key_fp.as_deref(), Some(fp.as_str()));

        server.stop().await;
        server.stop().await;
        assert!(server.local_addr().await.is_none());
        assert!(announcer.record().is_none());
    }

    #[tokio::test]
    async fn denied_peer_gets_negative_ack() {
        let mut auth = MockPeerAuthorizer::new();
        auth.expect_authorize()
            .returning(|_, _| AuthDecision::Deny("not paired".into()));
        let (collab, _) = collab(Arc::new(auth));
        let server = ControlServer::new(config(), collab);
        let mut events = server.subscribe();
        let addr = server.start(0).await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut viewer = Link::new(stream, LinkConfig::default());
        viewer.sender().send_control(viewer_hello()).unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(2), viewer.recv())
            .await
            .unwrap()
            .unwrap();
        match Message::decode(&packet).unwrap() {
            Message::Control(ControlMessage::HelloAck {
                accepted, reason, ..
            }) => {
                assert!(!accepted);
                assert_eq!(reason.as_deref(), Some("not paired"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            SessionEvent::HandshakeFailed {
                reason: FailureReason::Unauthorized,
                ..
            }
        ));
        assert!(server.active_session().await.is_none());
        server.stop().await;
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (collab, _) = collab(Arc::new(AllowListAuthorizer::allow_any()));
        let server = ControlServer::new(config(), collab);
        let mut events = server.subscribe();
        let addr = server.start(0).await.unwrap();

        let _stream = TcpStream::connect(addr).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            SessionEvent::HandshakeFailed {
                reason: FailureReason::HandshakeTimeout,
                ..
            }
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn plaintext_hello_is_refused_when_encryption_required() {
        let (collab, _) = collab(Arc::new(AllowListAuthorizer::allow_any()));
        let server = ControlServer::new(config(), collab);
        let mut events = server.subscribe();
        let addr = server.start(0).await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut viewer = Link::new(stream, LinkConfig::default());
        viewer.sender().send_control(viewer_hello_with(None)).unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(2), viewer.recv())
            .await
            .unwrap()
            .unwrap();
        match Message::decode(&packet).unwrap() {
            Message::Control(ControlMessage::HelloAck {
                accepted, reason, ..
            }) => {
                assert!(!accepted);
                assert_eq!(reason.as_deref(), Some("encryption required"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SessionEvent::HandshakeFailed { .. }));
        server.stop().await;
    }

    #[tokio::test]
    async fn ack_leads_and_session_traffic_is_sealed() {
        use crate::codec::FrameCodec;
        use crate::message::MessageType;
        use futures::{SinkExt, StreamExt};
        use tokio_util::codec::Framed;

        let (collab, _) = collab(Arc::new(AllowListAuthorizer::allow_any()));
        let server = ControlServer::new(config(), collab);
        let addr = server.start(0).await.unwrap();

        let mut wire = Framed::new(TcpStream::connect(addr).await.unwrap(), FrameCodec);
        let kx = KeyExchange::new();
        let hello = viewer_hello_with(Some(kx.key_share().to_vec()));
        wire.send(hello.into_packet().unwrap()).await.unwrap();

        async fn next(wire: &mut Framed<TcpStream, FrameCodec>) -> Packet {
            tokio::time::timeout(Duration::from_secs(2), wire.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap()
        }
        let first = next(&mut wire).await;
        assert_eq!(first.kind(), MessageType::Control);
        let Message::Control(ControlMessage::HelloAck {
            accepted: true,
            key_share: Some(share),
            ..
        }) = Message::decode(&first).unwrap()
        else {
            panic!("expected an accepted HelloAck first, got {first:?}");
        };

        let (_, mut opener) = kx.agree(Role::Initiator, &share).unwrap().split();
        let sealed = next(&mut wire).await;
        assert_eq!(sealed.kind(), MessageType::Sealed);
        let inner = opener.open(&sealed).unwrap();
        assert!(matches!(Message::decode(&inner).unwrap(), Message::Video(_)));
        server.stop().await;
    }
}
