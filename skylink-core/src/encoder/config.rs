//! Codec model and encoding configuration.
//!
//! Profiles are protocol-level tags. Mapping them to platform codec
//! constants happens only inside a [`CompressionBackend`].
//!
//! [`CompressionBackend`]: crate::encoder::CompressionBackend

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capture::Resolution;
use crate::error::SkyError;

/// Frame rates a session may run at, ascending.
pub const SUPPORTED_FRAME_RATES: [u32; 4] = [15, 30, 60, 120];

// ── CodecProfile ─────────────────────────────────────────────────

/// Requested codec and profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecProfile {
    H264Baseline,
    H264Main,
    H264High,
    HevcMain,
    /// Best available hardware codec.
    Auto,
    /// Software zstd raw-image codec.
    RawImage,
}

impl CodecProfile {
    /// Profiles to try on the primary backend, in order, for this request.
    pub fn fallback_chain(self) -> &'static [CodecProfile] {
        match self {
            CodecProfile::HevcMain | CodecProfile::Auto => {
                &[CodecProfile::HevcMain, CodecProfile::H264High]
            }
            CodecProfile::H264Baseline => &[CodecProfile::H264Baseline],
            CodecProfile::H264Main => &[CodecProfile::H264Main],
            CodecProfile::H264High => &[CodecProfile::H264High],
            CodecProfile::RawImage => &[CodecProfile::RawImage],
        }
    }

    /// Bitstream tag carried on the wire. `Auto` resolves to a concrete
    /// profile before a session exists, so it has none.
    pub fn tag(self) -> Option<CodecTag> {
        match self {
            CodecProfile::H264Baseline | CodecProfile::H264Main | CodecProfile::H264High => {
                Some(CodecTag::H264)
            }
            CodecProfile::HevcMain => Some(CodecTag::Hevc),
            CodecProfile::RawImage => Some(CodecTag::RawImage),
            CodecProfile::Auto => None,
        }
    }
}

impl fmt::Display for CodecProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CodecProfile::H264Baseline => "h264-baseline",
            CodecProfile::H264Main => "h264-main",
            CodecProfile::H264High => "h264-high",
            CodecProfile::HevcMain => "hevc-main",
            CodecProfile::Auto => "auto",
            CodecProfile::RawImage => "raw-image",
        };
        f.write_str(s)
    }
}

// ── CodecTag ─────────────────────────────────────────────────────

/// Bitstream format of an encoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecTag {
    H264,
    Hevc,
    RawImage,
}

impl fmt::Display for CodecTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CodecTag::H264 => "h264",
            CodecTag::Hevc => "hevc",
            CodecTag::RawImage => "raw_image",
        };
        f.write_str(s)
    }
}

// ── QualityProfile ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    /// Lowest latency; nearest-neighbour scaling.
    Speed,
    #[default]
    Balanced,
    Quality,
}

// ── EncodingConfiguration ────────────────────────────────────────

/// Everything the encoder needs to set up a compression session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingConfiguration {
    pub codec: CodecProfile,
    pub resolution: Resolution,
    pub bitrate_bps: u32,
    pub frame_rate: u32,
    /// Frames between forced keyframes.
    pub keyframe_interval: u32,
    pub low_latency: bool,
    pub quality: QualityProfile,
}

impl Default for EncodingConfiguration {
    fn default() -> Self {
        Self {
            codec: CodecProfile::H264High,
            resolution: Resolution::new(1280, 720),
            bitrate_bps: 4_000_000,
            frame_rate: 30,
            keyframe_interval: 60,
            low_latency: true,
            quality: QualityProfile::Balanced,
        }
    }
}

impl EncodingConfiguration {
    /// Check internal consistency, independent of any display.
    pub fn check(&self) -> Result<(), SkyError> {
        if self.bitrate_bps == 0 {
            return Err(SkyError::InvalidConfig("bitrate must be > 0".into()));
        }
        if !SUPPORTED_FRAME_RATES.contains(&self.frame_rate) {
            return Err(SkyError::InvalidConfig(format!(
                "frame rate {} not in {:?}",
                self.frame_rate, SUPPORTED_FRAME_RATES
            )));
        }
        if !self.resolution.is_valid() {
            return Err(SkyError::InvalidConfig(format!(
                "resolution {} must be non-zero and even",
                self.resolution
            )));
        }
        if self.keyframe_interval == 0 {
            return Err(SkyError::InvalidConfig(
                "keyframe interval must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// [`check`](Self::check) plus: resolution must not exceed `capture`.
    pub fn validate(&self, capture: Resolution) -> Result<(), SkyError> {
        self.check()?;
        if !self.resolution.fits_within(capture) {
            return Err(SkyError::InvalidConfig(format!(
                "resolution {} exceeds capture resolution {}",
                self.resolution, capture
            )));
        }
        Ok(())
    }

    /// Whether moving from `self` to `next` needs a new compression
    /// session. Bitrate, frame rate and keyframe interval apply live.
    pub fn requires_session_rebuild(&self, next: &EncodingConfiguration) -> bool {
        self.codec != next.codec
            || self.resolution != next.resolution
            || self.quality != next.quality
            || self.low_latency != next.low_latency
    }
}

/// Next supported frame rate below `fps`.
pub fn lower_frame_rate(fps: u32) -> Option<u32> {
    SUPPORTED_FRAME_RATES
        .iter()
        .rev()
        .copied()
        .find(|&r| r < fps)
}

/// Next supported frame rate above `fps`.
pub fn higher_frame_rate(fps: u32) -> Option<u32> {
    SUPPORTED_FRAME_RATES.iter().copied().find(|&r| r > fps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn fallback_chains() {
        assert_eq!(
            CodecProfile::HevcMain.fallback_chain(),
            &[CodecProfile::HevcMain, CodecProfile::H264High]
        );
        assert_eq!(
            CodecProfile::Auto.fallback_chain(),
            &[CodecProfile::HevcMain, CodecProfile::H264High]
        );
        assert_eq!(
            CodecProfile::H264Main.fallback_chain(),
            &[CodecProfile::H264Main]
        );
        assert_eq!(
            CodecProfile::RawImage.fallback_chain(),
            &[CodecProfile::RawImage]
        );
    }

    #[test]
    fn tags() {
        assert_eq!(CodecProfile::H264Baseline.tag(), Some(CodecTag::H264));
        assert_eq!(CodecProfile::HevcMain.tag(), Some(CodecTag::Hevc));
        assert_eq!(CodecProfile::Auto.tag(), None);
        assert_eq!(CodecTag::RawImage.to_string(), "raw_image");
    }

    #[test]
    fn validation() {
        let capture = Resolution::new(1920, 1080);
        let good = EncodingConfiguration::default();
        assert_ok!(good.validate(capture));

        let bad_fps = EncodingConfiguration {
            frame_rate: 25,
            ..good
        };
        assert_err!(bad_fps.validate(capture));

        let too_big = EncodingConfiguration {
            resolution: Resolution::new(3840, 2160),
            ..good
        };
        assert_ok!(too_big.check());
        assert_err!(too_big.validate(capture));

        let zero_bitrate = EncodingConfiguration {
            bitrate_bps: 0,
            ..good
        };
        assert_err!(zero_bitrate.check());
    }

    #[test]
    fn rebuild_detection() {
        let a = EncodingConfiguration::default();
        let bitrate_only = EncodingConfiguration {
            bitrate_bps: 1_000_000,
            frame_rate: 60,
            ..a
        };
        assert!(!a.requires_session_rebuild(&bitrate_only));

        let new_res = EncodingConfiguration {
            resolution: Resolution::new(960, 540),
            ..a
        };
        assert!(a.requires_session_rebuild(&new_res));
    }

    #[test]
    fn frame_rate_steps() {
        assert_eq!(lower_frame_rate(60), Some(30));
        assert_eq!(lower_frame_rate(15), None);
        assert_eq!(higher_frame_rate(30), Some(60));
        assert_eq!(higher_frame_rate(120), None);
    }
}
