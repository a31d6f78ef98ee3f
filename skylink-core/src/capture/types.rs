//! Frame representations shared between the capture, processing and
//! encoding stages.
//!
//! These are **internal** pipeline types. The serialisable wire type is
//! [`crate::protocol::VideoPayload`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SkyError;

// ── Resolution ───────────────────────────────────────────────────

/// Width × height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Non-zero and even in both dimensions (4:2:0 chroma needs even sizes).
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.width % 2 == 0 && self.height % 2 == 0
    }

    pub fn fits_within(&self, other: Resolution) -> bool {
        self.width <= other.width && self.height <= other.height
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Scale both dimensions by `factor`, rounding down to even values.
    /// Never returns a dimension below 2.
    pub fn scaled(&self, factor: f64) -> Resolution {
        let scale = |v: u32| (((v as f64 * factor) as u32) & !1).max(2);
        Resolution::new(scale(self.width), scale(self.height))
    }

    /// Component-wise minimum, rounded down to even values.
    pub fn clamp_to(&self, bound: Resolution) -> Resolution {
        Resolution::new(
            (self.width.min(bound.width) & !1).max(2),
            (self.height.min(bound.height) & !1).max(2),
        )
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha (DXGI default).
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

// ── CaptureRegion ────────────────────────────────────────────────

/// A sub-rectangle of the display to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CaptureRegion {
    /// Intersect with a display of `bounds`. Returns `None` when the
    /// intersection is empty.
    pub fn clamp_to(&self, bounds: Resolution) -> Option<CaptureRegion> {
        if self.x >= bounds.width || self.y >= bounds.height {
            return None;
        }
        let width = self.width.min(bounds.width - self.x);
        let height = self.height.min(bounds.height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(CaptureRegion {
            x: self.x,
            y: self.y,
            width,
            height,
        })
    }
}

// ── SourceFrame ──────────────────────────────────────────────────

/// A full-display bitmap exactly as a [`CaptureSource`] produced it.
///
/// The `data` buffer holds `height` rows of `stride` bytes each.
/// `stride` may be larger than `width * bytes_per_pixel` due to
/// GPU row-alignment requirements (DXGI pads rows).
///
/// [`CaptureSource`]: crate::capture::CaptureSource
#[derive(Debug)]
pub struct SourceFrame {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl SourceFrame {
    fn check_layout(&self) -> Result<(), SkyError> {
        let row_len = self.width as usize * self.format.bytes_per_pixel();
        let needed = self.stride as usize * self.height as usize;
        if (self.stride as usize) < row_len || self.data.len() < needed {
            return Err(SkyError::CaptureUnavailable(format!(
                "source frame layout invalid: {}x{} stride {} with {} bytes",
                self.width,
                self.height,
                self.stride,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Turn this bitmap into a [`CapturedFrame`], cropping to `region`
    /// when one is given. Cropped output is tightly packed.
    pub fn into_captured(
        self,
        region: Option<CaptureRegion>,
        pts: Duration,
    ) -> Result<CapturedFrame, SkyError> {
        self.check_layout()?;
        let source_resolution = Resolution::new(self.width, self.height);

        let Some(region) = region.and_then(|r| r.clamp_to(source_resolution)) else {
            return Ok(CapturedFrame {
                width: self.width,
                height: self.height,
                stride: self.stride,
                format: self.format,
                data: self.data,
                pts,
                source_resolution,
            });
        };

        let bpp = self.format.bytes_per_pixel();
        let row_len = region.width as usize * bpp;
        let mut data = Vec::with_capacity(row_len * region.height as usize);
        for y in region.y..region.y + region.height {
            let start = y as usize * self.stride as usize + region.x as usize * bpp;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        Ok(CapturedFrame {
            width: region.width,
            height: region.height,
            stride: row_len as u32,
            format: self.format,
            data,
            pts,
            source_resolution,
        })
    }
}

// ── CapturedFrame ────────────────────────────────────────────────

/// A raw, uncompressed frame handed from the capture engine to the
/// pipeline.
///
/// Deliberately not `Clone`: each frame has exactly one owner as it
/// moves capture → processor → encoder.
#[derive(Debug)]
pub struct CapturedFrame {
    /// Frame width in pixels (after region cropping).
    pub width: u32,
    /// Frame height in pixels (after region cropping).
    pub height: u32,
    /// Row pitch in **bytes** (may exceed `width * bpp`).
    pub stride: u32,
    pub format: PixelFormat,
    /// Raw pixel data: `stride * height` bytes.
    pub data: Vec<u8>,
    /// Presentation timestamp relative to capture start.
    pub pts: Duration,
    /// Resolution of the display the frame was taken from.
    pub source_resolution: Resolution,
}

impl CapturedFrame {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Returns a row slice (including possible padding bytes).
    ///
    /// # Panics
    ///
    /// Panics if `y` is out of bounds.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.stride as usize]
    }

    /// Returns the pixel bytes at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.stride as usize + x as usize * bpp;
        &self.data[offset..offset + bpp]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(w: u32, h: u32) -> SourceFrame {
        // Padded rows: stride = w*4 + 8.
        let stride = w * 4 + 8;
        let mut data = vec![0u8; (stride * h) as usize];
        for y in 0..h {
            for x in 0..w {
                let o = (y * stride + x * 4) as usize;
                data[o] = x as u8;
                data[o + 1] = y as u8;
            }
        }
        SourceFrame {
            width: w,
            height: h,
            stride,
            format: PixelFormat::Bgra8,
            data,
        }
    }

    #[test]
    fn resolution_validation() {
        assert!(Resolution::new(1280, 720).is_valid());
        assert!(!Resolution::new(1281, 720).is_valid());
        assert!(!Resolution::new(0, 720).is_valid());
    }

    #[test]
    fn resolution_scaling_stays_even() {
        let r = Resolution::new(1280, 720).scaled(0.75);
        assert_eq!(r, Resolution::new(960, 540));
        let odd = Resolution::new(1366, 768).scaled(0.75);
        assert!(odd.is_valid());
    }

    #[test]
    fn full_frame_keeps_stride() {
        let frame = source(8, 4).into_captured(None, Duration::ZERO).unwrap();
        assert_eq!(frame.stride, 8 * 4 + 8);
        assert_eq!(frame.source_resolution, Resolution::new(8, 4));
        assert_eq!(frame.pixel(3, 2)[..2], [3, 2]);
    }

    #[test]
    fn region_crop_is_tightly_packed() {
        let region = CaptureRegion {
            x: 2,
            y: 1,
            width: 4,
            height: 2,
        };
        let frame = source(8, 4)
            .into_captured(Some(region), Duration::from_millis(16))
            .unwrap();
        assert_eq!(frame.resolution(), Resolution::new(4, 2));
        assert_eq!(frame.stride, 16);
        assert_eq!(frame.pixel(0, 0)[..2], [2, 1]);
        assert_eq!(frame.pixel(3, 1)[..2], [5, 2]);
        assert_eq!(frame.source_resolution, Resolution::new(8, 4));
    }

    #[test]
    fn region_outside_display_falls_back_to_full() {
        let region = CaptureRegion {
            x: 100,
            y: 0,
            width: 4,
            height: 4,
        };
        let frame = source(8, 4)
            .into_captured(Some(region), Duration::ZERO)
            .unwrap();
        assert_eq!(frame.resolution(), Resolution::new(8, 4));
    }

    #[test]
    fn short_buffer_rejected() {
        let mut s = source(8, 4);
        s.data.truncate(10);
        assert!(matches!(
            s.into_captured(None, Duration::ZERO),
            Err(SkyError::CaptureUnavailable(_))
        ));
    }
}
