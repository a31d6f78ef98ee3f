//! Session lifecycle and the status interface observers subscribe to.
//!
//! ```text
//!  Connecting ──► Connected ──► Disconnected
//!       │             │
//!       └─────────────┴───────► Failed(reason)
//! ```
//!
//! Every transition and metric change is published twice: as a
//! [`SessionEvent`] on a broadcast channel shared by all sessions of a
//! server, and folded into the per-session [`SessionInfo`] snapshot.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Instant, SystemTime};

use tokio::sync::{broadcast, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::encoder::{CodecTag, EncodingConfiguration};
use crate::error::{FailureReason, SkyError};
use crate::protocol::PeerIdentity;
use crate::quality::{ConnectionQualitySample, QualityLevel};
use crate::transport::PathKind;

// ── SessionState ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Connecting,
    Connected,
    Disconnected,
    Failed(FailureReason),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed(_))
    }

    /// Move to `to` if the lifecycle allows it.
    ///
    /// Valid: `Connecting → Connected`, and any non-terminal state to
    /// `Disconnected` or `Failed`.
    pub fn transition(&mut self, to: SessionState) -> Result<(), SkyError> {
        let allowed = match (*self, to) {
            (Self::Connecting, Self::Connected) => true,
            (Self::Connecting | Self::Connected, Self::Disconnected | Self::Failed(_)) => true,
            _ => false,
        };
        if !allowed {
            return Err(SkyError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        *self = to;
        Ok(())
    }
}

// ── Events ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Capture produced faster than the pipeline consumed.
    Capture,
    Processing,
    Encode,
    /// Send queue overflow.
    Backpressure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        session_id: Uuid,
        state: SessionState,
    },
    QualityChanged {
        session_id: Uuid,
        level: QualityLevel,
        stability: f64,
    },
    EncodingChanged {
        session_id: Uuid,
        codec: Option<CodecTag>,
        config: EncodingConfiguration,
    },
    FrameDropped {
        session_id: Uuid,
        reason: DropReason,
    },
    Error {
        session_id: Option<Uuid>,
        message: String,
    },
    /// An inbound connection never became a session.
    HandshakeFailed {
        peer: SocketAddr,
        reason: FailureReason,
    },
}

// ── SessionInfo ──────────────────────────────────────────────────

/// Point-in-time view of one session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub peer: Option<PeerIdentity>,
    pub remote_addr: Option<SocketAddr>,
    pub path: Option<PathKind>,
    pub state: SessionState,
    pub codec: Option<CodecTag>,
    pub encoding: Option<EncodingConfiguration>,
    pub quality: Option<QualityLevel>,
    pub last_sample: Option<ConnectionQualitySample>,
    pub created_at: SystemTime,
    pub last_activity: Instant,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

impl SessionInfo {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            peer: None,
            remote_addr: None,
            path: None,
            state: SessionState::Connecting,
            codec: None,
            encoding: None,
            quality: None,
            last_sample: None,
            created_at: SystemTime::now(),
            last_activity: Instant::now(),
            frames_sent: 0,
            frames_dropped: 0,
        }
    }
}

// ── SessionStatus ────────────────────────────────────────────────

/// Single writer of a session's observable state. Shared by the
/// session's tasks; usable from the capture thread as well.
#[derive(Debug)]
pub struct SessionStatus {
    id: Uuid,
    info: watch::Sender<SessionInfo>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionStatus {
    pub fn new(id: Uuid, events: broadcast::Sender<SessionEvent>) -> Self {
        let (info, _) = watch::channel(SessionInfo::new(id));
        Self { id, info, events }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn snapshot(&self) -> SessionInfo {
        self.info.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionInfo> {
        self.info.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.info.borrow().state
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn set_peer(
        &self,
        peer: PeerIdentity,
        remote_addr: Option<SocketAddr>,
        path: Option<PathKind>,
    ) {
        self.info.send_modify(|info| {
            info.peer = Some(peer);
            info.remote_addr = remote_addr;
            info.path = path;
        });
    }

    pub fn transition(&self, to: SessionState) -> Result<(), SkyError> {
        let mut outcome = Ok(());
        self.info.send_if_modified(|info| match info.state.transition(to) {
            Ok(()) => true,
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome?;
        info!(session = %self.id, state = %to, "session state changed");
        self.emit(SessionEvent::StateChanged {
            session_id: self.id,
            state: to,
        });
        Ok(())
    }

    pub fn set_encoding(&self, codec: Option<CodecTag>, config: EncodingConfiguration) {
        self.info.send_modify(|info| {
            info.codec = codec;
            info.encoding = Some(config);
        });
        self.emit(SessionEvent::EncodingChanged {
            session_id: self.id,
            codec,
            config,
        });
    }

    /// Record a quality sample; an event is only published when the
    /// level changes.
    pub fn record_quality(&self, sample: ConnectionQualitySample) {
        let level = sample.quality_level();
        let mut changed = false;
        self.info.send_modify(|info| {
            changed = info.quality != Some(level);
            info.quality = Some(level);
            info.last_sample = Some(sample);
        });
        if changed {
            self.emit(SessionEvent::QualityChanged {
                session_id: self.id,
                level,
                stability: sample.stability_score(),
            });
        }
    }

    pub fn record_sent(&self, frames: u64) {
        if frames == 0 {
            return;
        }
        self.info.send_modify(|info| info.frames_sent += frames);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.info.send_modify(|info| info.frames_dropped += 1);
        debug!(session = %self.id, ?reason, "frame dropped");
        self.emit(SessionEvent::FrameDropped {
            session_id: self.id,
            reason,
        });
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.emit(SessionEvent::Error {
            session_id: Some(self.id),
            message: message.into(),
        });
    }

    /// Note inbound traffic from the peer.
    pub fn touch(&self) {
        self.info.send_if_modified(|info| {
            info.last_activity = Instant::now();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status() -> (SessionStatus, broadcast::Receiver<SessionEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (SessionStatus::new(Uuid::new_v4(), tx), rx)
    }

    #[test]
    fn lifecycle_transitions() {
        let mut s = SessionState::default();
        assert!(s.transition(SessionState::Connected).is_ok());
        assert!(s.transition(SessionState::Connecting).is_err());
        assert!(s.transition(SessionState::Disconnected).is_ok());
        assert!(s.is_terminal());
        assert!(s.transition(SessionState::Connected).is_err());

        let mut s = SessionState::Connecting;
        s.transition(SessionState::Failed(FailureReason::EncoderUnavailable))
            .unwrap();
        assert_eq!(s.to_string(), "failed(encoderUnavailable)");
        assert!(s.transition(SessionState::Disconnected).is_err());
    }

    #[test]
    fn transitions_are_published() {
        let (status, mut rx) = status();
        status.transition(SessionState::Connected).unwrap();
        assert_eq!(status.state(), SessionState::Connected);
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::StateChanged {
                session_id: status.id(),
                state: SessionState::Connected
            }
        );

        assert!(status.transition(SessionState::Connecting).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn quality_event_only_on_level_change() {
        let (status, mut rx) = status();
        let sample = ConnectionQualitySample {
            latency: Duration::from_millis(10),
            loss: 0.0,
            bandwidth_bps: 1_000_000,
            jitter: Duration::ZERO,
            send_backlog: 0,
            taken_at: Instant::now(),
        };
        status.record_quality(sample);
        status.record_quality(sample);
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::QualityChanged {
                level: QualityLevel::Excellent,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(status.snapshot().quality, Some(QualityLevel::Excellent));
    }

    #[test]
    fn counters_accumulate() {
        let (status, _rx) = status();
        status.record_sent(3);
        status.record_drop(DropReason::Backpressure);
        let info = status.snapshot();
        assert_eq!(info.frames_sent, 3);
        assert_eq!(info.frames_dropped, 1);
    }
}
