//! Hardware encoder with codec fallback and presentation-order output.
//!
//! ```text
//!  initialize(cfg) ─► try cfg.codec.fallback_chain() on the primary backend
//!                     └─► all failed? software raw-image backend (if enabled)
//!                         └─► nothing? SkyError::EncoderUnavailable
//!
//!  encode(buf, pts) ─► session.submit ─► outputs arrive on a channel
//!                      └─► released strictly in pts order
//! ```
//!
//! A frame whose output never arrives within `output_timeout` is skipped
//! so one lost frame cannot stall the stream.

pub mod backend;
pub mod config;
#[cfg(any(test, feature = "test-support"))]
pub mod simulated;
pub mod software;

use std::collections::{BTreeMap, btree_map::Entry};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SkyError;
use crate::processor::ProcessedBuffer;

pub use backend::{
    CompressionBackend, CompressionSession, OutputSink, SessionOutput, SessionParameters,
};
#[cfg(any(test, feature = "test-support"))]
pub use simulated::SimulatedBackend;
pub use config::{
    CodecProfile, CodecTag, EncodingConfiguration, QualityProfile, SUPPORTED_FRAME_RATES,
};
pub use software::{RawImageBackend, RawImageDecoder};

// ── EncodedPacket ────────────────────────────────────────────────

/// One compressed access unit, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    /// Increases by one per emitted packet.
    pub sequence: u64,
    pub pts: Duration,
    pub width: u32,
    pub height: u32,
    pub codec: CodecTag,
    pub is_keyframe: bool,
    pub data: Bytes,
}

// ── EncoderSettings ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct EncoderSettings {
    /// How long a submitted frame may wait for its output.
    pub output_timeout: Duration,
    /// Frames allowed in the codec before `encode` waits on the oldest.
    pub max_in_flight: usize,
    /// Bound on flushing during shutdown.
    pub shutdown_timeout: Duration,
    /// Fall back to the software raw-image codec when no hardware
    /// codec can be created.
    pub software_fallback: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            output_timeout: Duration::from_millis(500),
            max_in_flight: 3,
            shutdown_timeout: Duration::from_secs(3),
            software_fallback: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub encoded: u64,
    pub skipped: u64,
    pub sessions_created: u64,
}

// ── HardwareEncoder ──────────────────────────────────────────────

struct PendingFrame {
    submitted: Instant,
    width: u32,
    height: u32,
    output: Option<SessionOutput>,
}

struct ActiveSession {
    session: Box<dyn CompressionSession>,
    outputs: mpsc::UnboundedReceiver<SessionOutput>,
    profile: CodecProfile,
    codec: CodecTag,
}

pub struct HardwareEncoder {
    hardware: Arc<dyn CompressionBackend>,
    software: Option<Arc<dyn CompressionBackend>>,
    settings: EncoderSettings,
    config: Option<EncodingConfiguration>,
    active: Option<ActiveSession>,
    pending: BTreeMap<Duration, PendingFrame>,
    last_pts: Option<Duration>,
    frames_since_keyframe: u32,
    force_keyframe: bool,
    sequence: u64,
    stats: EncoderStats,
}

impl HardwareEncoder {
    pub fn new(hardware: Arc<dyn CompressionBackend>, settings: EncoderSettings) -> Self {
        let software: Option<Arc<dyn CompressionBackend>> = settings
            .software_fallback
            .then(|| Arc::new(RawImageBackend) as Arc<dyn CompressionBackend>);
        Self {
            hardware,
            software,
            settings,
            config: None,
            active: None,
            pending: BTreeMap::new(),
            last_pts: None,
            frames_since_keyframe: 0,
            force_keyframe: true,
            sequence: 0,
            stats: EncoderStats::default(),
        }
    }

    /// Create a session for `config`, walking the fallback chain.
    /// Returns the effective configuration, whose `codec` names the
    /// profile actually in use.
    pub fn initialize(
        &mut self,
        config: EncodingConfiguration,
    ) -> Result<EncodingConfiguration, SkyError> {
        config.check()?;
        self.teardown_session();

        let active = self.open_session(&config)?;
        let effective = EncodingConfiguration {
            codec: active.profile,
            ..config
        };
        if active.profile != config.codec {
            warn!(
                requested = %config.codec,
                active = %active.profile,
                "requested codec unavailable, using fallback"
            );
        }
        info!(
            backend_codec = %active.codec,
            profile = %active.profile,
            resolution = %config.resolution,
            bitrate = config.bitrate_bps,
            fps = config.frame_rate,
            "encoder session created"
        );

        self.active = Some(active);
        self.config = Some(effective);
        self.force_keyframe = true;
        self.stats.sessions_created += 1;
        Ok(effective)
    }

    fn open_session(&self, config: &EncodingConfiguration) -> Result<ActiveSession, SkyError> {
        let params = SessionParameters::from(config);
        let mut failures = Vec::new();

        for &profile in config.codec.fallback_chain() {
            let (sink, outputs) = OutputSink::channel();
            match self.hardware.create_session(profile, &params, sink) {
                Ok(session) => {
                    return Ok(ActiveSession {
                        session,
                        outputs,
                        profile,
                        codec: profile.tag().unwrap_or(CodecTag::H264),
                    });
                }
                Err(e) => {
                    debug!(%profile, error = %e, "codec session creation failed");
                    failures.push(format!("{profile}: {e}"));
                }
            }
        }

        if let Some(software) = &self.software {
            let (sink, outputs) = OutputSink::channel();
            match software.create_session(CodecProfile::RawImage, &params, sink) {
                Ok(session) => {
                    return Ok(ActiveSession {
                        session,
                        outputs,
                        profile: CodecProfile::RawImage,
                        codec: CodecTag::RawImage,
                    });
                }
                Err(e) => failures.push(format!("{}: {e}", CodecProfile::RawImage)),
            }
        }

        Err(SkyError::EncoderUnavailable(if failures.is_empty() {
            format!("no codec available for {}", config.codec)
        } else {
            failures.join("; ")
        }))
    }

    /// Submit one frame and return every packet now releasable in
    /// presentation order. May wait for the codec when too many frames
    /// are in flight.
    ///
    /// A per-frame codec failure returns [`SkyError::EncodeFailed`]; the
    /// encoder stays usable.
    pub async fn encode(
        &mut self,
        buffer: &ProcessedBuffer,
        pts: Duration,
    ) -> Result<Vec<EncodedPacket>, SkyError> {
        let config = self
            .config
            .ok_or_else(|| SkyError::EncoderUnavailable("encoder not initialized".into()))?;
        if self.last_pts.is_some_and(|last| pts <= last) {
            self.stats.skipped += 1;
            return Err(SkyError::EncodeFailed {
                pts,
                reason: "presentation timestamp not increasing".into(),
            });
        }

        let keyframe = self.force_keyframe
            || self.frames_since_keyframe == 0
            || self.frames_since_keyframe >= config.keyframe_interval;

        let active = self
            .active
            .as_mut()
            .ok_or_else(|| SkyError::EncoderUnavailable("no compression session".into()))?;
        if let Err(e) = active.session.submit(buffer, pts, keyframe) {
            self.stats.skipped += 1;
            warn!(?pts, error = %e, "frame encode failed, skipping");
            return Err(match e {
                e @ SkyError::EncodeFailed { .. } => e,
                other => SkyError::EncodeFailed {
                    pts,
                    reason: other.to_string(),
                },
            });
        }

        self.last_pts = Some(pts);
        if keyframe {
            self.frames_since_keyframe = 1;
            self.force_keyframe = false;
        } else {
            self.frames_since_keyframe += 1;
        }
        self.pending.insert(
            pts,
            PendingFrame {
                submitted: Instant::now(),
                width: buffer.width(),
                height: buffer.height(),
                output: None,
            },
        );

        self.drain(self.settings.max_in_flight, None).await
    }

    /// Pull outputs and release them in order. Waits on the head frame
    /// while more than `keep` frames are in flight. With a `deadline`,
    /// heads not resolved by then are skipped.
    async fn drain(
        &mut self,
        keep: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<EncodedPacket>, SkyError> {
        let mut released = Vec::new();
        loop {
            self.collect_ready();
            self.release_in_order(&mut released);

            let Some((&head_pts, head)) = self.pending.first_key_value() else {
                break;
            };
            let head_deadline = deadline.unwrap_or(head.submitted + self.settings.output_timeout);
            let overdue = Instant::now() >= head_deadline;
            if self.pending.len() <= keep && !overdue {
                break;
            }
            if overdue {
                self.pending.remove(&head_pts);
                self.stats.skipped += 1;
                warn!(pts = ?head_pts, "encoder output timed out, skipping frame");
                continue;
            }

            let Some(active) = self.active.as_mut() else {
                break;
            };
            let wait = head_deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(wait, active.outputs.recv()).await {
                Ok(Some(out)) => self.accept(out),
                Ok(None) => {
                    return Err(SkyError::EncoderUnavailable(
                        "compression session output closed".into(),
                    ));
                }
                // Loop again; the head is now overdue.
                Err(_) => {}
            }
        }
        Ok(released)
    }

    fn collect_ready(&mut self) {
        let mut ready = Vec::new();
        if let Some(active) = self.active.as_mut() {
            while let Ok(out) = active.outputs.try_recv() {
                ready.push(out);
            }
        }
        for out in ready {
            self.accept(out);
        }
    }

    fn accept(&mut self, out: SessionOutput) {
        match self.pending.entry(out.pts()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().output = Some(out);
            }
            Entry::Vacant(_) => debug!(pts = ?out.pts(), "late encoder output discarded"),
        }
    }

    fn release_in_order(&mut self, released: &mut Vec<EncodedPacket>) {
        let codec = match &self.active {
            Some(a) => a.codec,
            None => return,
        };
        while let Some(entry) = self.pending.first_entry() {
            if entry.get().output.is_none() {
                break;
            }
            let (pts, frame) = entry.remove_entry();
            match frame.output {
                Some(SessionOutput::Frame {
                    data, is_keyframe, ..
                }) => {
                    released.push(EncodedPacket {
                        sequence: self.sequence,
                        pts,
                        width: frame.width,
                        height: frame.height,
                        codec,
                        is_keyframe,
                        data,
                    });
                    self.sequence += 1;
                    self.stats.encoded += 1;
                }
                Some(SessionOutput::Dropped { reason, .. }) => {
                    self.stats.skipped += 1;
                    warn!(?pts, %reason, "codec dropped frame");
                }
                None => {}
            }
        }
    }

    /// Apply a new configuration between frames. Bitrate, frame rate and
    /// keyframe interval apply to the live session; codec, resolution or
    /// profile changes recreate it (forcing a keyframe). Packets flushed
    /// from a replaced session are returned.
    pub async fn reconfigure(
        &mut self,
        config: EncodingConfiguration,
    ) -> Result<(EncodingConfiguration, Vec<EncodedPacket>), SkyError> {
        config.check()?;
        let Some(current) = self.config else {
            return self.initialize(config).map(|c| (c, Vec::new()));
        };

        if !current.requires_session_rebuild(&config) {
            if config.bitrate_bps != current.bitrate_bps {
                if let Some(active) = self.active.as_mut() {
                    active.session.set_bitrate(config.bitrate_bps)?;
                }
            }
            let effective = EncodingConfiguration {
                codec: current.codec,
                ..config
            };
            self.config = Some(effective);
            debug!(bitrate = config.bitrate_bps, fps = config.frame_rate, "encoder updated live");
            return Ok((effective, Vec::new()));
        }

        let flushed = self.flush_pending().await;
        let effective = self.initialize(config)?;
        info!(resolution = %effective.resolution, codec = %effective.codec, "encoder session rebuilt");
        Ok((effective, flushed))
    }

    async fn flush_pending(&mut self) -> Vec<EncodedPacket> {
        if let Some(active) = self.active.as_mut() {
            if let Err(e) = active.session.flush() {
                warn!(error = %e, "encoder flush failed");
            }
        }
        let deadline = Instant::now() + self.settings.shutdown_timeout;
        match self.drain(0, Some(deadline)).await {
            Ok(packets) => packets,
            Err(e) => {
                warn!(error = %e, "encoder drain failed");
                Vec::new()
            }
        }
    }

    /// Flush pending frames, then release the session.
    pub async fn shutdown(&mut self) -> Vec<EncodedPacket> {
        if self.active.is_none() {
            return Vec::new();
        }
        let flushed = self.flush_pending().await;
        self.teardown_session();
        self.config = None;
        info!(
            encoded = self.stats.encoded,
            skipped = self.stats.skipped,
            "encoder shut down"
        );
        flushed
    }

    fn teardown_session(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.session.invalidate();
        }
        self.pending.clear();
        self.last_pts = None;
        self.frames_since_keyframe = 0;
    }

    /// Make the next submitted frame a keyframe.
    pub fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    pub fn active_profile(&self) -> Option<CodecProfile> {
        self.active.as_ref().map(|a| a.profile)
    }

    pub fn active_codec(&self) -> Option<CodecTag> {
        self.active.as_ref().map(|a| a.codec)
    }

    pub fn configuration(&self) -> Option<EncodingConfiguration> {
        self.config
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }
}

impl Drop for HardwareEncoder {
    fn drop(&mut self) {
        if self.active.is_some() {
            debug!("encoder dropped with a live session, invalidating");
            self.teardown_session();
        }
    }
}
