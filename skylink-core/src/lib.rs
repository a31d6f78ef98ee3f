//! # skylink-core
//!
//! Remote-desktop streaming core.
//!
//! ```text
//!  CaptureSource ─► CaptureEngine ─► FrameProcessor ─► HardwareEncoder ─► Link ═► peer
//!                                                           ▲               │
//!                                         AdaptiveBitrateController ◄─ QualityMonitor
//! ```
//!
//! This crate contains:
//! - **Wire framing**: `Packet`, `MessageType`, `FrameCodec` (`[u32 len][u8 type][payload]`)
//! - **Protocol payloads**: video packets, mouse/keyboard input, control messages
//! - **Capture**: `CaptureEngine` driving a `CaptureSource` on its own thread
//! - **Processing**: `FrameProcessor` scaling and colour correction under a texture budget
//! - **Encoding**: `HardwareEncoder` with codec fallback and a software raw-image codec
//! - **Transport**: STUN NAT classification, direct/relay establishment, the framed `Link`
//! - **Crypto**: P-256 key agreement in the handshake, AES-256-GCM sealed frames after it
//! - **Quality**: `QualityMonitor` samples and the `AdaptiveBitrateController`
//! - **Session**: `ControlServer`, `SessionHandle` and the status event stream
//! - **Error**: `SkyError`, a typed `thiserror` hierarchy, and `FailureReason`

pub mod abr;
pub mod capture;
pub mod codec;
pub mod crypto;
pub mod encoder;
pub mod error;
pub mod message;
pub mod packet;
pub mod processor;
pub mod protocol;
pub mod quality;
pub mod session;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use abr::{AbrConfig, AbrDecision, AdaptiveBitrateController};
pub use capture::{CaptureEngine, CaptureSettings, CaptureSource, Resolution, SyntheticSource};
pub use codec::FrameCodec;
pub use crypto::{KeyExchange, Role, SessionKeys};
pub use encoder::{
    CodecProfile, CodecTag, CompressionBackend, EncodedPacket, EncoderSettings,
    EncodingConfiguration, HardwareEncoder,
};
pub use error::{FailureReason, SkyError};
pub use message::MessageType;
pub use packet::{FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, Packet};
pub use processor::FrameProcessor;
pub use protocol::{Capabilities, ControlMessage, InputEvent, Message, PeerIdentity, VideoPayload};
pub use quality::{ConnectionQualitySample, QualityLevel, QualityMonitor};
pub use session::{
    ControlServer, ServerConfig, SessionEvent, SessionHandle, SessionInfo, SessionState,
};
pub use transport::{Link, LinkConfig, LinkState, NatType, PathKind};
