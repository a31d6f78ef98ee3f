//! Per-session media pipeline.
//!
//! ```text
//!  capture thread ──try_send──► frames (bounded) ─┐
//!  QualityMonitor ──────────► samples ────────────┼──► select! ──► process ─► encode ─► LinkSender
//!  SessionHandle / dispatcher ► commands ─────────┘          │
//!                                                            └─► ABR ─► reconfigure
//! ```
//!
//! The pipeline task is the single owner of the active
//! [`EncodingConfiguration`]. ABR decisions and user updates both go
//! through it and reach the encoder only between frames.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::abr::{AbrConfig, AbrDecision, AdaptiveBitrateController};
use crate::capture::{CaptureEngine, CaptureSettings, CaptureSource, CapturedFrame};
use crate::encoder::{
    CompressionBackend, EncodedPacket, EncoderSettings, EncodingConfiguration, HardwareEncoder,
};
use crate::error::SkyError;
use crate::processor::{DEFAULT_TEXTURE_BUDGET, FrameProcessor, TexturePool};
use crate::quality::ConnectionQualitySample;
use crate::session::state::{DropReason, SessionState, SessionStatus};
use crate::transport::LinkSender;

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub capture: CaptureSettings,
    pub encoding: EncodingConfiguration,
    pub encoder: EncoderSettings,
    pub abr: AbrConfig,
    pub texture_budget: usize,
    /// Captured frames allowed to wait for the processor; further frames
    /// are dropped on the capture thread.
    pub frame_queue: usize,
    /// Bound on stopping capture and on shutting down the encoder.
    pub teardown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            encoding: EncodingConfiguration::default(),
            encoder: EncoderSettings::default(),
            abr: AbrConfig::default(),
            texture_budget: DEFAULT_TEXTURE_BUDGET,
            frame_queue: 2,
            teardown_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PipelineCommand {
    /// User settings change. Becomes the new ABR target.
    UpdateEncoding(EncodingConfiguration),
    RequestKeyframe,
}

pub struct Pipeline {
    capture: CaptureEngine,
    processor: FrameProcessor,
    encoder: HardwareEncoder,
    abr: AdaptiveBitrateController,
    config: PipelineConfig,
    current: EncodingConfiguration,
    link: LinkSender,
    status: Arc<SessionStatus>,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn CaptureSource>,
        backend: Arc<dyn CompressionBackend>,
        config: PipelineConfig,
        link: LinkSender,
        status: Arc<SessionStatus>,
    ) -> Result<Self, SkyError> {
        config.capture.validate()?;
        config.encoding.validate(config.capture.resolution)?;
        let abr = AdaptiveBitrateController::new(config.abr, config.encoding)?;
        let processor = FrameProcessor::new(
            TexturePool::new(config.texture_budget),
            config.encoding.resolution,
            config.encoding.quality,
        );
        Ok(Self {
            capture: CaptureEngine::new(source),
            processor,
            encoder: HardwareEncoder::new(backend, config.encoder),
            abr,
            current: config.encoding,
            config,
            link,
            status,
        })
    }

    /// Start capture and encoding, stream until cancelled, then tear
    /// down. An `Err` is a session-level failure.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<PipelineCommand>,
        mut samples: mpsc::Receiver<ConnectionQualitySample>,
        cancel: CancellationToken,
    ) -> Result<(), SkyError> {
        let outcome = self.stream(&mut commands, &mut samples, &cancel).await;
        if let Err(e) = &outcome {
            warn!(session = %self.status.id(), error = %e, "pipeline failed");
        }
        self.teardown().await;
        outcome
    }

    async fn stream(
        &mut self,
        commands: &mut mpsc::Receiver<PipelineCommand>,
        samples: &mut mpsc::Receiver<ConnectionQualitySample>,
        cancel: &CancellationToken,
    ) -> Result<(), SkyError> {
        let effective = self.encoder.initialize(self.current)?;
        self.current = effective;
        self.status.set_encoding(self.encoder.active_codec(), effective);

        let mut frames = self.start_capture()?;
        self.status.transition(SessionState::Connected)?;
        let mut commands_open = true;
        let mut samples_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(PipelineCommand::RequestKeyframe) => self.encoder.request_keyframe(),
                    Some(PipelineCommand::UpdateEncoding(target)) => {
                        if let Err(e) = target.validate(self.config.capture.resolution) {
                            warn!(error = %e, "rejected encoding update");
                            self.status.record_error(e.to_string());
                            continue;
                        }
                        self.abr.set_target(target);
                        self.apply(target).await?;
                    }
                    None => commands_open = false,
                },
                sample = samples.recv(), if samples_open => match sample {
                    Some(sample) => self.on_sample(sample).await?,
                    None => samples_open = false,
                },
                frame = frames.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await?,
                    None => {
                        return Err(SkyError::CaptureUnavailable(
                            "capture stopped unexpectedly".into(),
                        ));
                    }
                },
            }
        }
    }

    fn start_capture(&mut self) -> Result<mpsc::Receiver<CapturedFrame>, SkyError> {
        let capture = CaptureSettings {
            frame_rate: self.current.frame_rate,
            ..self.config.capture
        };
        self.capture
            .configure(capture.resolution, capture.frame_rate, capture.region)?;

        let (tx, rx) = mpsc::channel(self.config.frame_queue.max(1));
        let status = Arc::clone(&self.status);
        self.capture.start(move |frame| {
            // Never block the capture thread.
            if tx.try_send(frame).is_err() {
                status.record_drop(DropReason::Capture);
            }
        })?;
        Ok(rx)
    }

    async fn on_frame(&mut self, frame: CapturedFrame) -> Result<(), SkyError> {
        // Encoding into a full queue would only displace queued frames.
        if self.link.video_congested() {
            self.status.record_drop(DropReason::Backpressure);
            return Ok(());
        }
        if self.link.take_keyframe_request() {
            self.encoder.request_keyframe();
        }
        let pts = frame.pts;
        let buffer = match self.processor.process(frame) {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "frame processing failed");
                self.status.record_drop(DropReason::Processing);
                return Ok(());
            }
        };
        match self.encoder.encode(&buffer, pts).await {
            Ok(packets) => self.send(&packets),
            Err(e) if e.is_per_frame() => {
                self.status.record_drop(DropReason::Encode);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn send(&self, packets: &[EncodedPacket]) -> Result<(), SkyError> {
        let mut sent = 0;
        for packet in packets {
            if self.link.send_video(packet)?.dropped() {
                self.status.record_drop(DropReason::Backpressure);
            }
            sent += 1;
        }
        self.status.record_sent(sent);
        Ok(())
    }

    async fn on_sample(&mut self, sample: ConnectionQualitySample) -> Result<(), SkyError> {
        self.status.record_quality(sample);
        match self.abr.update(&sample, &self.current) {
            AbrDecision::Hold => Ok(()),
            AbrDecision::Decrease(next) | AbrDecision::Increase(next) => self.apply(next).await,
        }
    }

    /// Push `next` to the encoder, processor and capture rate. A rejected
    /// reconfiguration keeps the previous settings.
    async fn apply(&mut self, next: EncodingConfiguration) -> Result<(), SkyError> {
        let (effective, flushed) = match self.encoder.reconfigure(next).await {
            Ok(done) => done,
            Err(e @ SkyError::EncoderUnavailable(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "encoder reconfiguration failed, keeping previous settings");
                self.status.record_error(e.to_string());
                return Ok(());
            }
        };
        self.send(&flushed)?;

        self.processor
            .set_target(effective.resolution, effective.quality);
        if effective.frame_rate != self.current.frame_rate {
            let capture = CaptureSettings {
                frame_rate: effective.frame_rate,
                ..self.capture.settings()
            };
            self.capture.update_configuration(capture)?;
        }
        info!(
            session = %self.status.id(),
            codec = %effective.codec,
            resolution = %effective.resolution,
            bitrate = effective.bitrate_bps,
            fps = effective.frame_rate,
            "encoding updated"
        );
        self.current = effective;
        self.status.set_encoding(self.encoder.active_codec(), effective);
        Ok(())
    }

    /// Stop capture and shut the encoder down, each bounded by the
    /// teardown timeout.
    async fn teardown(self) {
        let timeout = self.config.teardown_timeout;
        let Pipeline {
            mut capture,
            mut encoder,
            link,
            ..
        } = self;

        let stopping = tokio::task::spawn_blocking(move || capture.stop());
        if tokio::time::timeout(timeout, stopping).await.is_err() {
            warn!(?timeout, "capture did not stop in time; abandoning capture thread");
        }

        match tokio::time::timeout(timeout, encoder.shutdown()).await {
            Ok(flushed) => {
                for packet in &flushed {
                    if link.send_video(packet).is_err() {
                        break;
                    }
                }
            }
            Err(_) => warn!(?timeout, "encoder shutdown timed out; dropping session"),
        }
    }
}
