//! Compression backends: the seam between the encoder and a platform
//! codec.
//!
//! A backend creates sessions; a session accepts frames and reports
//! results through an [`OutputSink`] whenever the codec is done, from
//! whatever thread the codec calls back on.
//!
//! ```text
//! HardwareEncoder ──submit(buffer, pts)──► CompressionSession
//!        ▲                                        │ (codec thread)
//!        └────────── mpsc ◄── OutputSink::emit ◄──┘
//! ```

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::capture::Resolution;
use crate::encoder::config::{CodecProfile, EncodingConfiguration, QualityProfile};
use crate::error::SkyError;
use crate::processor::ProcessedBuffer;

// ── SessionParameters ────────────────────────────────────────────

/// Properties a compression session is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParameters {
    pub resolution: Resolution,
    pub bitrate_bps: u32,
    pub frame_rate: u32,
    pub keyframe_interval: u32,
    pub low_latency: bool,
    pub quality: QualityProfile,
    /// Always `false`: B-frames would reorder output.
    pub allow_frame_reordering: bool,
}

impl From<&EncodingConfiguration> for SessionParameters {
    fn from(cfg: &EncodingConfiguration) -> Self {
        Self {
            resolution: cfg.resolution,
            bitrate_bps: cfg.bitrate_bps,
            frame_rate: cfg.frame_rate,
            keyframe_interval: cfg.keyframe_interval,
            low_latency: cfg.low_latency,
            quality: cfg.quality,
            allow_frame_reordering: false,
        }
    }
}

// ── SessionOutput / OutputSink ───────────────────────────────────

/// Result of one submitted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Frame {
        pts: Duration,
        data: Bytes,
        is_keyframe: bool,
    },
    /// The codec gave up on this frame.
    Dropped { pts: Duration, reason: String },
}

impl SessionOutput {
    pub fn pts(&self) -> Duration {
        match self {
            SessionOutput::Frame { pts, .. } | SessionOutput::Dropped { pts, .. } => *pts,
        }
    }
}

/// Completion handle given to a session. Cloneable and `Send`, so it can
/// be moved into codec callbacks.
#[derive(Debug, Clone)]
pub struct OutputSink(mpsc::UnboundedSender<SessionOutput>);

impl OutputSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionOutput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Returns `false` once the encoder side has gone away.
    pub fn emit(&self, output: SessionOutput) -> bool {
        self.0.send(output).is_ok()
    }
}

// ── Traits ───────────────────────────────────────────────────────

/// Factory for compression sessions.
pub trait CompressionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Create a session for `profile`. Fails with
    /// [`SkyError::EncoderUnavailable`] when the profile is unsupported.
    fn create_session(
        &self,
        profile: CodecProfile,
        params: &SessionParameters,
        sink: OutputSink,
    ) -> Result<Box<dyn CompressionSession>, SkyError>;
}

/// One live codec instance.
pub trait CompressionSession: Send {
    /// Queue a frame. Output arrives later through the sink.
    fn submit(
        &mut self,
        buffer: &ProcessedBuffer,
        pts: Duration,
        force_keyframe: bool,
    ) -> Result<(), SkyError>;

    /// Change the target bitrate without recreating the session.
    fn set_bitrate(&mut self, bitrate_bps: u32) -> Result<(), SkyError>;

    /// Emit every frame still held by the codec.
    fn flush(&mut self) -> Result<(), SkyError>;

    /// Release the codec. Further calls are no-ops.
    fn invalidate(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_forbid_reordering() {
        let params = SessionParameters::from(&EncodingConfiguration::default());
        assert!(!params.allow_frame_reordering);
        assert_eq!(params.bitrate_bps, 4_000_000);
    }
}
