//! Domain-specific error types for the Skylink streaming core.
//!
//! All fallible operations return `Result<T, SkyError>`.
//! Per-frame failures (`ProcessingFailed`, `EncodeFailed`) are recovered
//! locally by the pipeline; everything else surfaces to the caller.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The canonical error type for the streaming core.
#[derive(Debug, Error)]
pub enum SkyError {
    // ── Capture Errors ───────────────────────────────────────────
    /// No capturable display exists or the capture handle could not be opened.
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// `start` was called on an engine that is already producing frames.
    #[error("capture already running")]
    AlreadyCapturing,

    /// The frame processor could not allocate an output texture.
    #[error("frame processing failed: {0}")]
    ProcessingFailed(String),

    // ── Encoder Errors ───────────────────────────────────────────
    /// A single frame failed to encode; the frame is skipped.
    #[error("encode failed for frame at {pts:?}: {reason}")]
    EncodeFailed { pts: Duration, reason: String },

    /// Every codec in the fallback chain failed to create a session.
    #[error("no encoder available: {0}")]
    EncoderUnavailable(String),

    // ── Transport Errors ─────────────────────────────────────────
    /// The listening port is already bound by another process.
    #[error("port {0} unavailable")]
    PortUnavailable(u16),

    /// Direct and relayed connection attempts were all exhausted.
    #[error("connection failed after {attempts} attempts: {reason}")]
    ConnectionFailed { attempts: u32, reason: String },

    /// A state machine rejected a transition.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Protocol Errors ──────────────────────────────────────────
    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A frame declared a payload larger than the protocol allows.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A packet violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Key agreement failed or a sealed frame did not authenticate.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The peer was rejected by the authorization collaborator.
    #[error("peer unauthorized: {0}")]
    Unauthorized(String),

    // ── Serialization / Configuration ────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl SkyError {
    /// Per-frame failures that the pipeline absorbs as degraded metrics.
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            SkyError::ProcessingFailed(_) | SkyError::EncodeFailed { .. }
        )
    }
}

// ── FailureReason ─────────────────────────────────────────────────

/// Reason code attached to a terminal session failure.
///
/// This is the diagnostic code exposed through the status interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    EncoderUnavailable,
    CaptureUnavailable,
    ConnectionFailed,
    ProtocolViolation,
    Unauthorized,
    HandshakeTimeout,
    /// A session task panicked.
    Internal,
}

impl FailureReason {
    /// Map a session-level error to its reason code.
    pub fn from_error(err: &SkyError) -> Self {
        match err {
            SkyError::EncoderUnavailable(_) => FailureReason::EncoderUnavailable,
            SkyError::CaptureUnavailable(_) | SkyError::AlreadyCapturing => {
                FailureReason::CaptureUnavailable
            }
            SkyError::Unauthorized(_) => FailureReason::Unauthorized,
            SkyError::Timeout(_) => FailureReason::HandshakeTimeout,
            SkyError::UnknownVariant { .. }
            | SkyError::FrameTooLarge { .. }
            | SkyError::ProtocolViolation(_)
            | SkyError::Crypto(_)
            | SkyError::Encoding(_) => FailureReason::ProtocolViolation,
            _ => FailureReason::ConnectionFailed,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::EncoderUnavailable => "encoderUnavailable",
            FailureReason::CaptureUnavailable => "captureUnavailable",
            FailureReason::ConnectionFailed => "connectionFailed",
            FailureReason::ProtocolViolation => "protocolViolation",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::HandshakeTimeout => "handshakeTimeout",
            FailureReason::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for SkyError {
    fn from(s: String) -> Self {
        SkyError::Other(s)
    }
}

impl From<&str> for SkyError {
    fn from(s: &str) -> Self {
        SkyError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SkyError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SkyError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for SkyError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        SkyError::Encoding(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SkyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SkyError::Timeout(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = SkyError::PortUnavailable(5901);
        assert!(e.to_string().contains("5901"));

        let e = SkyError::FrameTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
    }

    #[test]
    fn from_string() {
        let e: SkyError = "something broke".into();
        assert!(matches!(e, SkyError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: SkyError = io_err.into();
        assert!(matches!(e, SkyError::Connection(_)));
    }

    #[test]
    fn per_frame_classification() {
        assert!(SkyError::ProcessingFailed("oom".into()).is_per_frame());
        assert!(
            SkyError::EncodeFailed {
                pts: Duration::ZERO,
                reason: "busy".into()
            }
            .is_per_frame()
        );
        assert!(!SkyError::EncoderUnavailable("none".into()).is_per_frame());
    }

    #[test]
    fn failure_reason_mapping() {
        assert_eq!(
            FailureReason::from_error(&SkyError::EncoderUnavailable("x".into())),
            FailureReason::EncoderUnavailable
        );
        assert_eq!(
            FailureReason::from_error(&SkyError::ProtocolViolation("bad tag".into())),
            FailureReason::ProtocolViolation
        );
        assert_eq!(FailureReason::EncoderUnavailable.to_string(), "encoderUnavailable");
        assert_eq!(FailureReason::Internal.to_string(), "internal");
    }
}
