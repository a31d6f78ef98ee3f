//! Pluggable display sources.
//!
//! A [`CaptureSource`] wraps one OS-level capture handle. The engine
//! opens it on `start`, pulls frames from a dedicated thread and closes
//! it on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::capture::types::{PixelFormat, Resolution, SourceFrame};
use crate::error::SkyError;

/// A blocking producer of display bitmaps.
pub trait CaptureSource: Send + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Acquire the display. Fails with [`SkyError::CaptureUnavailable`]
    /// when no capturable display exists.
    fn open(&mut self, requested: Resolution) -> Result<Resolution, SkyError>;

    /// Block for at most `timeout` waiting for a new bitmap.
    /// `Ok(None)` means nothing changed on screen.
    fn grab(&mut self, timeout: Duration) -> Result<Option<SourceFrame>, SkyError>;

    /// Change the output size of an open source. Sources that can only
    /// deliver their native size ignore this.
    fn set_resolution(&mut self, _requested: Resolution) {}

    /// Release the OS handle. Must be safe to call more than once.
    fn close(&mut self);
}

// ── SyntheticSource ──────────────────────────────────────────────

/// Test-pattern display: a moving gradient at the requested size.
///
/// Counts outstanding handles so callers can assert that every
/// `open` was paired with a `close`.
pub struct SyntheticSource {
    resolution: Resolution,
    format: PixelFormat,
    available: bool,
    is_open: bool,
    frame_index: u64,
    open_handles: Arc<AtomicUsize>,
}

impl SyntheticSource {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            format: PixelFormat::Bgra8,
            available: true,
            is_open: false,
            frame_index: 0,
            open_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A source standing in for a machine with no capturable display.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(Resolution::new(2, 2))
        }
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Shared counter of handles currently open.
    pub fn open_handles(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.open_handles)
    }

    fn render(&self) -> SourceFrame {
        let bpp = self.format.bytes_per_pixel();
        let (w, h) = (self.resolution.width, self.resolution.height);
        let stride = w as usize * bpp;
        let shift = self.frame_index as usize;
        let mut data = vec![0u8; stride * h as usize];

        for (y, row) in data.chunks_exact_mut(stride).enumerate() {
            for (x, px) in row.chunks_exact_mut(bpp).enumerate() {
                px[0] = (x + shift) as u8;
                px[1] = y as u8;
                px[2] = (x ^ y) as u8;
                if bpp == 4 {
                    px[3] = 0xFF;
                }
            }
        }

        SourceFrame {
            width: w,
            height: h,
            stride: stride as u32,
            format: self.format,
            data,
        }
    }
}

impl CaptureSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn open(&mut self, requested: Resolution) -> Result<Resolution, SkyError> {
        if !self.available {
            return Err(SkyError::CaptureUnavailable(
                "no capturable display attached".into(),
            ));
        }
        if !self.is_open {
            self.is_open = true;
            self.open_handles.fetch_add(1, Ordering::SeqCst);
        }
        self.resolution = requested;
        Ok(self.resolution)
    }

    fn grab(&mut self, _timeout: Duration) -> Result<Option<SourceFrame>, SkyError> {
        if !self.is_open {
            return Err(SkyError::CaptureUnavailable("source is closed".into()));
        }
        let frame = self.render();
        self.frame_index += 1;
        Ok(Some(frame))
    }

    fn set_resolution(&mut self, requested: Resolution) {
        self.resolution = requested;
    }

    fn close(&mut self) {
        if self.is_open {
            self.is_open = false;
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
