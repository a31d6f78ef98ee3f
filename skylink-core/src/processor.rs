//! Frame processor: normalises, scales and colour-corrects captured
//! frames into encoder-ready BGRA buffers.
//!
//! ```text
//! CapturedFrame ──► normalise to BGRA ──► scale to target ──► colour LUT ──► ProcessedBuffer
//!                                            │
//!                                   TexturePool lease (released on drop)
//! ```
//!
//! Output never exceeds the input size: a target larger than the frame is
//! clamped, so the processor only ever downscales.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::capture::{CapturedFrame, PixelFormat, Resolution};
use crate::encoder::QualityProfile;
use crate::error::SkyError;

/// Default texture budget: three 4K BGRA surfaces.
pub const DEFAULT_TEXTURE_BUDGET: usize = 3 * 3840 * 2160 * 4;

// ── TexturePool ──────────────────────────────────────────────────

/// Byte budget shared by every output buffer in flight.
#[derive(Debug, Clone)]
pub struct TexturePool {
    budget: usize,
    in_use: Arc<AtomicUsize>,
}

impl TexturePool {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve `bytes`, failing with [`SkyError::ProcessingFailed`] when
    /// the budget is exhausted.
    pub fn acquire(&self, bytes: usize) -> Result<TextureLease, SkyError> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.budget {
                return Err(SkyError::ProcessingFailed(format!(
                    "texture budget exhausted: {current} of {} bytes in use, {bytes} requested",
                    self.budget
                )));
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(TextureLease {
                        bytes,
                        in_use: Arc::clone(&self.in_use),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn budget(&self) -> usize {
        self.budget
    }
}

impl Default for TexturePool {
    fn default() -> Self {
        Self::new(DEFAULT_TEXTURE_BUDGET)
    }
}

/// A reservation against a [`TexturePool`].
#[derive(Debug)]
pub struct TextureLease {
    bytes: usize,
    in_use: Arc<AtomicUsize>,
}

impl Drop for TextureLease {
    fn drop(&mut self) {
        self.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

// ── ColorAdjust ──────────────────────────────────────────────────

/// Per-channel colour correction applied through a 256-entry table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAdjust {
    /// Added after contrast, in -1.0..=1.0.
    pub brightness: f32,
    /// Multiplier around mid-grey, in 0.0..=2.0.
    pub contrast: f32,
    /// Output = input^(1/gamma).
    pub gamma: f32,
}

impl Default for ColorAdjust {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 1.0,
            gamma: 1.0,
        }
    }
}

impl ColorAdjust {
    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    fn lut(&self) -> [u8; 256] {
        let mut table = [0u8; 256];
        let gamma = if self.gamma > 0.0 { self.gamma } else { 1.0 };
        for (i, slot) in table.iter_mut().enumerate() {
            let v = i as f32 / 255.0;
            let v = v.powf(1.0 / gamma);
            let v = (v - 0.5) * self.contrast + 0.5 + self.brightness;
            *slot = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
        table
    }
}

// ── ProcessedBuffer ──────────────────────────────────────────────

/// Encoder-ready frame: tightly packed BGRA at the target resolution.
#[derive(Debug)]
pub struct ProcessedBuffer {
    data: Vec<u8>,
    resolution: Resolution,
    pts: Duration,
    _lease: TextureLease,
}

impl ProcessedBuffer {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    pub fn pts(&self) -> Duration {
        self.pts
    }

    /// Row pitch in bytes.
    pub fn stride(&self) -> usize {
        self.resolution.width as usize * 4
    }
}

// ── FrameProcessor ───────────────────────────────────────────────

pub struct FrameProcessor {
    pool: TexturePool,
    target: Resolution,
    quality: QualityProfile,
    color: ColorAdjust,
    lut: Option<[u8; 256]>,
}

impl FrameProcessor {
    pub fn new(pool: TexturePool, target: Resolution, quality: QualityProfile) -> Self {
        Self {
            pool,
            target,
            quality,
            color: ColorAdjust::default(),
            lut: None,
        }
    }

    /// Follow an encoder configuration change.
    pub fn set_target(&mut self, target: Resolution, quality: QualityProfile) {
        self.target = target;
        self.quality = quality;
    }

    pub fn set_color(&mut self, color: ColorAdjust) {
        self.lut = (!color.is_identity()).then(|| color.lut());
        self.color = color;
    }

    pub fn target(&self) -> Resolution {
        self.target
    }

    pub fn pool(&self) -> &TexturePool {
        &self.pool
    }

    /// Consume `frame` and produce a buffer at the target resolution.
    pub fn process(&self, frame: CapturedFrame) -> Result<ProcessedBuffer, SkyError> {
        let out_res = self.target.clamp_to(frame.resolution());
        let out_len = out_res.pixel_count() as usize * 4;
        let lease = self.pool.acquire(out_len)?;

        let bgra = normalize(&frame)?;
        let src_res = frame.resolution();
        let mut data = if out_res == src_res {
            bgra
        } else {
            match self.quality {
                QualityProfile::Speed => scale_nearest(&bgra, src_res, out_res),
                QualityProfile::Balanced | QualityProfile::Quality => {
                    scale_bilinear(&bgra, src_res, out_res)
                }
            }
        };

        if let Some(lut) = &self.lut {
            for px in data.chunks_exact_mut(4) {
                px[0] = lut[px[0] as usize];
                px[1] = lut[px[1] as usize];
                px[2] = lut[px[2] as usize];
            }
        }

        debug!(from = %src_res, to = %out_res, pts = ?frame.pts, "frame processed");
        Ok(ProcessedBuffer {
            data,
            resolution: out_res,
            pts: frame.pts,
            _lease: lease,
        })
    }
}

/// Tightly packed BGRA copy of `frame`.
fn normalize(frame: &CapturedFrame) -> Result<Vec<u8>, SkyError> {
    let bpp = frame.format.bytes_per_pixel();
    let (w, h) = (frame.width as usize, frame.height as usize);
    let stride = frame.stride as usize;
    if stride < w * bpp || frame.data.len() < stride * h {
        return Err(SkyError::ProcessingFailed(format!(
            "frame buffer too small for {}x{} stride {}",
            w, h, stride
        )));
    }

    let mut out = Vec::with_capacity(w * h * 4);
    for y in 0..h {
        let row = &frame.data[y * stride..y * stride + w * bpp];
        match frame.format {
            PixelFormat::Bgra8 => out.extend_from_slice(row),
            PixelFormat::Rgba8 => {
                for px in row.chunks_exact(4) {
                    out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
                }
            }
            PixelFormat::Rgb8 => {
                for px in row.chunks_exact(3) {
                    out.extend_from_slice(&[px[2], px[1], px[0], 0xFF]);
                }
            }
        }
    }
    Ok(out)
}

fn scale_nearest(src: &[u8], from: Resolution, to: Resolution) -> Vec<u8> {
    let (sw, sh) = (from.width as usize, from.height as usize);
    let (dw, dh) = (to.width as usize, to.height as usize);
    let mut out = vec![0u8; dw * dh * 4];

    for y in 0..dh {
        let sy = y * sh / dh;
        for x in 0..dw {
            let sx = x * sw / dw;
            let s = (sy * sw + sx) * 4;
            let d = (y * dw + x) * 4;
            out[d..d + 4].copy_from_slice(&src[s..s + 4]);
        }
    }
    out
}

fn scale_bilinear(src: &[u8], from: Resolution, to: Resolution) -> Vec<u8> {
    let (sw, sh) = (from.width as usize, from.height as usize);
    let (dw, dh) = (to.width as usize, to.height as usize);
    let mut out = vec![0u8; dw * dh * 4];
    let x_ratio = sw as f32 / dw as f32;
    let y_ratio = sh as f32 / dh as f32;

    for y in 0..dh {
        // Sample at pixel centres.
        let fy = ((y as f32 + 0.5) * y_ratio - 0.5).max(0.0);
        let y0 = (fy as usize).min(sh - 1);
        let y1 = (y0 + 1).min(sh - 1);
        let wy = fy - y0 as f32;

        for x in 0..dw {
            let fx = ((x as f32 + 0.5) * x_ratio - 0.5).max(0.0);
            let x0 = (fx as usize).min(sw - 1);
            let x1 = (x0 + 1).min(sw - 1);
            let wx = fx - x0 as f32;

            let p00 = (y0 * sw + x0) * 4;
            let p01 = (y0 * sw + x1) * 4;
            let p10 = (y1 * sw + x0) * 4;
            let p11 = (y1 * sw + x1) * 4;
            let d = (y * dw + x) * 4;

            for c in 0..4 {
                let top = src[p00 + c] as f32 * (1.0 - wx) + src[p01 + c] as f32 * wx;
                let bottom = src[p10 + c] as f32 * (1.0 - wx) + src[p11 + c] as f32 * wx;
                out[d + c] = (top * (1.0 - wy) + bottom * wy).round() as u8;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(w: u32, h: u32, format: PixelFormat, fill: &[u8]) -> CapturedFrame {
        let bpp = format.bytes_per_pixel();
        let data = fill
            .iter()
            .copied()
            .cycle()
            .take(w as usize * h as usize * bpp)
            .collect();
        CapturedFrame {
            width: w,
            height: h,
            stride: w * bpp as u32,
            format,
            data,
            pts: Duration::from_millis(33),
            source_resolution: Resolution::new(w, h),
        }
    }

    #[test]
    fn downscales_to_target() {
        let p = FrameProcessor::new(
            TexturePool::default(),
            Resolution::new(1280, 720),
            QualityProfile::Balanced,
        );
        let out = p
            .process(frame(1920, 1080, PixelFormat::Bgra8, &[10, 20, 30, 255]))
            .unwrap();
        assert_eq!(out.resolution(), Resolution::new(1280, 720));
        assert_eq!(out.data().len(), 1280 * 720 * 4);
        assert_eq!(&out.data()[..4], &[10, 20, 30, 255]);
        assert_eq!(out.pts(), Duration::from_millis(33));
    }

    #[test]
    fn never_upscales() {
        let p = FrameProcessor::new(
            TexturePool::default(),
            Resolution::new(1920, 1080),
            QualityProfile::Speed,
        );
        let out = p
            .process(frame(640, 360, PixelFormat::Bgra8, &[1, 2, 3, 4]))
            .unwrap();
        assert_eq!(out.resolution(), Resolution::new(640, 360));
    }

    #[test]
    fn rgba_and_rgb_normalised_to_bgra() {
        let p = FrameProcessor::new(
            TexturePool::default(),
            Resolution::new(4, 4),
            QualityProfile::Speed,
        );
        let out = p
            .process(frame(4, 4, PixelFormat::Rgba8, &[200, 100, 50, 255]))
            .unwrap();
        assert_eq!(&out.data()[..4], &[50, 100, 200, 255]);

        let out = p
            .process(frame(4, 4, PixelFormat::Rgb8, &[200, 100, 50]))
            .unwrap();
        assert_eq!(&out.data()[..4], &[50, 100, 200, 255]);
    }

    #[test]
    fn nearest_and_bilinear_agree_on_flat_images() {
        let src = || frame(8, 8, PixelFormat::Bgra8, &[77, 77, 77, 255]);
        let mut p = FrameProcessor::new(
            TexturePool::default(),
            Resolution::new(4, 4),
            QualityProfile::Speed,
        );
        let nearest = p.process(src()).unwrap();
        p.set_target(Resolution::new(4, 4), QualityProfile::Quality);
        let bilinear = p.process(src()).unwrap();
        assert_eq!(nearest.data(), bilinear.data());
    }

    #[test]
    fn texture_budget_exhaustion_is_processing_failure() {
        let pool = TexturePool::new(4 * 4 * 4);
        let p = FrameProcessor::new(pool.clone(), Resolution::new(4, 4), QualityProfile::Speed);

        let held = p
            .process(frame(4, 4, PixelFormat::Bgra8, &[0, 0, 0, 0]))
            .unwrap();
        assert_eq!(pool.in_use(), 64);
        assert!(matches!(
            p.process(frame(4, 4, PixelFormat::Bgra8, &[0, 0, 0, 0])),
            Err(SkyError::ProcessingFailed(_))
        ));

        drop(held);
        assert_eq!(pool.in_use(), 0);
        assert!(p.process(frame(4, 4, PixelFormat::Bgra8, &[0, 0, 0, 0])).is_ok());
    }

    #[test]
    fn color_lut_applies_to_colour_channels_only() {
        let mut p = FrameProcessor::new(
            TexturePool::default(),
            Resolution::new(2, 2),
            QualityProfile::Speed,
        );
        p.set_color(ColorAdjust {
            brightness: 1.0,
            ..ColorAdjust::default()
        });
        let out = p
            .process(frame(2, 2, PixelFormat::Bgra8, &[10, 10, 10, 128]))
            .unwrap();
        assert_eq!(&out.data()[..4], &[255, 255, 255, 128]);
    }
}
