//! Deterministic compression backend for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;

use crate::encoder::backend::{
    CompressionBackend, CompressionSession, OutputSink, SessionOutput, SessionParameters,
};
use crate::encoder::config::CodecProfile;
use crate::error::SkyError;
use crate::processor::ProcessedBuffer;

// ── SimulatedBackend ─────────────────────────────────────────────

/// Deterministic stand-in for a hardware codec, for tests only. Its
/// output is not decodable.
///
/// Emits a small bitstream per frame (Annex-B start code, keyframe flag,
/// dimensions, blake3 digest of the pixels). Profiles can be marked
/// unsupported, per-frame failures injected, and output held back and
/// released in reverse to exercise reorder handling.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    unsupported: Vec<CodecProfile>,
    fail_every: Option<u64>,
    reorder_depth: usize,
    live_sessions: Arc<AtomicUsize>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to create sessions for `profile`.
    pub fn without(mut self, profile: CodecProfile) -> Self {
        self.unsupported.push(profile);
        self
    }

    /// Reject every `n`th submitted frame.
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    /// Hold up to `depth` frames and release them newest-first.
    pub fn reordering(mut self, depth: usize) -> Self {
        self.reorder_depth = depth;
        self
    }

    /// Sessions created and not yet invalidated.
    pub fn live_sessions(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live_sessions)
    }
}

impl CompressionBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn create_session(
        &self,
        profile: CodecProfile,
        params: &SessionParameters,
        sink: OutputSink,
    ) -> Result<Box<dyn CompressionSession>, SkyError> {
        if profile == CodecProfile::Auto || profile == CodecProfile::RawImage {
            return Err(SkyError::EncoderUnavailable(format!(
                "simulated backend cannot create {profile} sessions"
            )));
        }
        if self.unsupported.contains(&profile) {
            return Err(SkyError::EncoderUnavailable(format!(
                "{profile} not supported by this device"
            )));
        }
        if params.allow_frame_reordering {
            return Err(SkyError::EncoderUnavailable(
                "frame reordering is not supported".into(),
            ));
        }
        self.live_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedSession {
            sink,
            submitted: 0,
            fail_every: self.fail_every,
            reorder_depth: self.reorder_depth,
            held: VecDeque::new(),
            live: Some(Arc::clone(&self.live_sessions)),
        }))
    }
}

struct SimulatedSession {
    sink: OutputSink,
    submitted: u64,
    fail_every: Option<u64>,
    reorder_depth: usize,
    held: VecDeque<SessionOutput>,
    live: Option<Arc<AtomicUsize>>,
}

impl SimulatedSession {
    fn release_held(&mut self) {
        while let Some(out) = self.held.pop_back() {
            self.sink.emit(out);
        }
    }
}

impl CompressionSession for SimulatedSession {
    fn submit(
        &mut self,
        buffer: &ProcessedBuffer,
        pts: Duration,
        force_keyframe: bool,
    ) -> Result<(), SkyError> {
        if self.live.is_none() {
            return Err(SkyError::EncoderUnavailable("session invalidated".into()));
        }
        self.submitted += 1;
        if let Some(n) = self.fail_every {
            if self.submitted % n == 0 {
                return Err(SkyError::EncodeFailed {
                    pts,
                    reason: "simulated codec error".into(),
                });
            }
        }

        let digest = blake3::hash(buffer.data());
        let mut data = Vec::with_capacity(4 + 1 + 8 + 32);
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.push(force_keyframe as u8);
        data.extend_from_slice(&buffer.width().to_be_bytes());
        data.extend_from_slice(&buffer.height().to_be_bytes());
        data.extend_from_slice(digest.as_bytes());

        self.held.push_back(SessionOutput::Frame {
            pts,
            data: Bytes::from(data),
            is_keyframe: force_keyframe,
        });
        if self.held.len() > self.reorder_depth {
            self.release_held();
        }
        Ok(())
    }

    fn set_bitrate(&mut self, _bitrate_bps: u32) -> Result<(), SkyError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SkyError> {
        self.release_held();
        Ok(())
    }

    fn invalidate(&mut self) {
        self.held.clear();
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        self.invalidate();
    }
}
