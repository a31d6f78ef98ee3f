//! Software raw-image codec (zstd).
//!
//! Used when no hardware codec can be created. Keyframes carry the whole
//! BGRA frame; delta frames carry the XOR against the previous frame,
//! which is mostly zeros on a static desktop and compresses well.
//!
//! ```text
//! keyframe:  zstd(frame)
//! delta:     zstd(frame XOR previous)
//! ```

use std::time::Duration;

use bytes::Bytes;

use crate::encoder::backend::{
    CompressionBackend, CompressionSession, OutputSink, SessionOutput, SessionParameters,
};
use crate::encoder::config::{CodecProfile, CodecTag};
use crate::error::SkyError;
use crate::processor::ProcessedBuffer;
use crate::protocol::VideoPayload;

/// zstd level for a target bitrate: generous links get the fastest level.
fn level_for_bitrate(bitrate_bps: u32) -> i32 {
    match bitrate_bps {
        b if b >= 8_000_000 => 1,
        b if b >= 2_000_000 => 3,
        b if b >= 500_000 => 6,
        _ => 9,
    }
}

// ── RawImageBackend ──────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct RawImageBackend;

impl CompressionBackend for RawImageBackend {
    fn name(&self) -> &str {
        "raw-image"
    }

    fn create_session(
        &self,
        profile: CodecProfile,
        params: &SessionParameters,
        sink: OutputSink,
    ) -> Result<Box<dyn CompressionSession>, SkyError> {
        if profile != CodecProfile::RawImage {
            return Err(SkyError::EncoderUnavailable(format!(
                "raw-image backend cannot encode {profile}"
            )));
        }
        Ok(Box::new(RawImageSession {
            sink,
            level: level_for_bitrate(params.bitrate_bps),
            previous: None,
            closed: false,
        }))
    }
}

struct RawImageSession {
    sink: OutputSink,
    level: i32,
    previous: Option<Vec<u8>>,
    closed: bool,
}

impl CompressionSession for RawImageSession {
    fn submit(
        &mut self,
        buffer: &ProcessedBuffer,
        pts: Duration,
        force_keyframe: bool,
    ) -> Result<(), SkyError> {
        if self.closed {
            return Err(SkyError::EncoderUnavailable("session invalidated".into()));
        }
        let frame = buffer.data();
        let reference = self
            .previous
            .as_deref()
            .filter(|prev| prev.len() == frame.len());

        let (raw, is_keyframe) = match reference {
            Some(prev) if !force_keyframe => {
                let xor: Vec<u8> = frame.iter().zip(prev).map(|(a, b)| a ^ b).collect();
                (xor, false)
            }
            _ => (frame.to_vec(), true),
        };

        let compressed = zstd::encode_all(raw.as_slice(), self.level).map_err(|e| {
            SkyError::EncodeFailed {
                pts,
                reason: format!("zstd encode failed: {e}"),
            }
        })?;
        self.previous = Some(frame.to_vec());

        self.sink.emit(SessionOutput::Frame {
            pts,
            data: Bytes::from(compressed),
            is_keyframe,
        });
        Ok(())
    }

    fn set_bitrate(&mut self, bitrate_bps: u32) -> Result<(), SkyError> {
        self.level = level_for_bitrate(bitrate_bps);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SkyError> {
        Ok(())
    }

    fn invalidate(&mut self) {
        self.closed = true;
        self.previous = None;
    }
}

// ── RawImageDecoder ──────────────────────────────────────────────

/// Viewer-side reconstruction of raw-image packets.
#[derive(Debug, Default)]
pub struct RawImageDecoder {
    frame: Vec<u8>,
    width: u32,
    height: u32,
}

impl RawImageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one packet and return the full BGRA frame.
    pub fn decode(&mut self, packet: &VideoPayload) -> Result<&[u8], SkyError> {
        if packet.codec != CodecTag::RawImage {
            return Err(SkyError::ProtocolViolation(format!(
                "raw-image decoder given {} packet",
                packet.codec
            )));
        }
        let raw = zstd::decode_all(packet.data.as_slice())
            .map_err(|e| SkyError::Encoding(format!("zstd decode failed: {e}")))?;
        let expected = packet.width as usize * packet.height as usize * 4;
        if raw.len() != expected {
            return Err(SkyError::ProtocolViolation(format!(
                "raw-image frame is {} bytes, expected {expected}",
                raw.len()
            )));
        }

        if packet.is_keyframe {
            self.frame = raw;
            self.width = packet.width;
            self.height = packet.height;
        } else {
            if self.width != packet.width || self.height != packet.height || self.frame.is_empty() {
                return Err(SkyError::ProtocolViolation(
                    "delta frame without a matching keyframe".into(),
                ));
            }
            for (px, d) in self.frame.iter_mut().zip(&raw) {
                *px ^= d;
            }
        }
        Ok(&self.frame)
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CapturedFrame, PixelFormat, Resolution};
    use crate::encoder::config::{EncodingConfiguration, QualityProfile};
    use crate::processor::{FrameProcessor, TexturePool};

    fn buffer(fill: u8, pts: Duration) -> ProcessedBuffer {
        let p = FrameProcessor::new(
            TexturePool::default(),
            Resolution::new(16, 8),
            QualityProfile::Speed,
        );
        p.process(CapturedFrame {
            width: 16,
            height: 8,
            stride: 64,
            format: PixelFormat::Bgra8,
            data: vec![fill; 16 * 8 * 4],
            pts,
            source_resolution: Resolution::new(16, 8),
        })
        .unwrap()
    }

    fn to_payload(out: SessionOutput) -> VideoPayload {
        match out {
            SessionOutput::Frame {
                pts,
                data,
                is_keyframe,
            } => VideoPayload {
                codec: CodecTag::RawImage,
                width: 16,
                height: 8,
                is_keyframe,
                sequence: 0,
                timestamp_us: pts.as_micros() as u64,
                data: data.to_vec(),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keyframe_then_delta_reconstructs() {
        let (sink, mut rx) = OutputSink::channel();
        let params = SessionParameters::from(&EncodingConfiguration::default());
        let mut session = RawImageBackend
            .create_session(CodecProfile::RawImage, &params, sink)
            .unwrap();

        session.submit(&buffer(7, Duration::ZERO), Duration::ZERO, true).unwrap();
        let pts = Duration::from_millis(33);
        session.submit(&buffer(9, pts), pts, false).unwrap();

        let first = to_payload(rx.try_recv().unwrap());
        let second = to_payload(rx.try_recv().unwrap());
        assert!(first.is_keyframe);
        assert!(!second.is_keyframe);

        let mut dec = RawImageDecoder::new();
        assert!(dec.decode(&first).unwrap().iter().all(|&b| b == 7));
        assert!(dec.decode(&second).unwrap().iter().all(|&b| b == 9));
    }

    #[test]
    fn delta_without_keyframe_is_rejected() {
        let (sink, mut rx) = OutputSink::channel();
        let params = SessionParameters::from(&EncodingConfiguration::default());
        let mut session = RawImageBackend
            .create_session(CodecProfile::RawImage, &params, sink)
            .unwrap();
        session.submit(&buffer(1, Duration::ZERO), Duration::ZERO, true).unwrap();
        session
            .submit(&buffer(2, Duration::from_millis(1)), Duration::from_millis(1), false)
            .unwrap();
        let _key = rx.try_recv().unwrap();
        let delta = to_payload(rx.try_recv().unwrap());

        let mut dec = RawImageDecoder::new();
        assert!(matches!(
            dec.decode(&delta),
            Err(SkyError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn only_raw_image_profile() {
        let (sink, _rx) = OutputSink::channel();
        let params = SessionParameters::from(&EncodingConfiguration::default());
        assert!(
            RawImageBackend
                .create_session(CodecProfile::H264High, &params, sink)
                .is_err()
        );
    }

    #[test]
    fn level_mapping() {
        assert_eq!(level_for_bitrate(10_000_000), 1);
        assert_eq!(level_for_bitrate(100_000), 9);
    }
}
