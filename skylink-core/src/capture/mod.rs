//! Capture engine: turns a [`CaptureSource`] into a paced stream of
//! [`CapturedFrame`]s.
//!
//! ```text
//!  start(on_frame) ──► open source ──► spawn "skylink-capture" thread
//!                                          │
//!                            ┌─────────────┘
//!                            ▼
//!                  grab ─► crop ─► on_frame(frame) ─► pace ─┐
//!                    ▲                                      │
//!                    └──────────── while running ◄──────────┘
//!
//!  stop() ──► running = false ──► join thread ──► source closed
//! ```
//!
//! The source is owned by a [`SourceLease`] inside the thread, so it is
//! closed even when the frame callback panics.

pub mod dxgi;
pub mod source;
pub mod types;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::SkyError;

pub use dxgi::DxgiSource;
pub use source::{CaptureSource, SyntheticSource};
pub use types::{CaptureRegion, CapturedFrame, PixelFormat, Resolution, SourceFrame};

/// Longest a single `grab` may block, so `stop` stays responsive.
const MAX_GRAB_TIMEOUT: Duration = Duration::from_millis(100);

// ── CaptureSettings ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub resolution: Resolution,
    pub frame_rate: u32,
    pub region: Option<CaptureRegion>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::new(1920, 1080),
            frame_rate: 30,
            region: None,
        }
    }
}

impl CaptureSettings {
    pub fn validate(&self) -> Result<(), SkyError> {
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(SkyError::InvalidConfig(format!(
                "capture resolution must be non-zero, got {}",
                self.resolution
            )));
        }
        if self.frame_rate == 0 {
            return Err(SkyError::InvalidConfig(
                "capture frame rate must be non-zero".into(),
            ));
        }
        if let Some(r) = self.region {
            if r.width == 0 || r.height == 0 {
                return Err(SkyError::InvalidConfig("capture region is empty".into()));
            }
        }
        Ok(())
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate as f64)
    }
}

// ── SourceLease ──────────────────────────────────────────────────

/// Scoped ownership of an open source. Closing happens on drop, which
/// covers normal exit, early return and unwinding alike. Dropping the
/// lease also clears the engine's running flag.
struct SourceLease {
    source: Option<Box<dyn CaptureSource>>,
    running: Arc<AtomicBool>,
}

impl SourceLease {
    fn source(&mut self) -> Option<&mut Box<dyn CaptureSource>> {
        self.source.as_mut()
    }

    /// Close the source and hand it back for reuse.
    fn release(mut self) -> Option<Box<dyn CaptureSource>> {
        let mut source = self.source.take()?;
        source.close();
        Some(source)
    }
}

impl Drop for SourceLease {
    fn drop(&mut self) {
        if let Some(source) = self.source.as_mut() {
            warn!(source = source.name(), "capture source released by unwinding");
            source.close();
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

// ── CaptureEngine ────────────────────────────────────────────────

type FrameCallback = Box<dyn FnMut(CapturedFrame) + Send + 'static>;

/// Owns one capture source and the thread that drives it.
pub struct CaptureEngine {
    source: Option<Box<dyn CaptureSource>>,
    configured: CaptureSettings,
    /// Live settings read by the capture thread before each frame.
    live: Arc<Mutex<CaptureSettings>>,
    running: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    worker: Option<JoinHandle<Option<Box<dyn CaptureSource>>>>,
}

impl CaptureEngine {
    pub fn new(source: Box<dyn CaptureSource>) -> Self {
        let configured = CaptureSettings::default();
        Self {
            source: Some(source),
            configured,
            live: Arc::new(Mutex::new(configured)),
            running: Arc::new(AtomicBool::new(false)),
            frames: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    /// Set resolution, rate and region for the next [`start`](Self::start).
    pub fn configure(
        &mut self,
        resolution: Resolution,
        frame_rate: u32,
        region: Option<CaptureRegion>,
    ) -> Result<(), SkyError> {
        let settings = CaptureSettings {
            resolution,
            frame_rate,
            region,
        };
        settings.validate()?;
        self.configured = settings;
        Ok(())
    }

    /// Begin producing frames. Each call of `on_frame` receives sole
    /// ownership of one frame, on the capture thread.
    pub fn start<F>(&mut self, on_frame: F) -> Result<(), SkyError>
    where
        F: FnMut(CapturedFrame) + Send + 'static,
    {
        if self.is_running() {
            return Err(SkyError::AlreadyCapturing);
        }
        // Reap a thread that ended on its own (source error).
        self.join_worker();

        let mut source = self
            .source
            .take()
            .ok_or_else(|| SkyError::CaptureUnavailable("capture source lost".into()))?;

        let native = match source.open(self.configured.resolution) {
            Ok(res) => res,
            Err(e) => {
                self.source = Some(source);
                return Err(e);
            }
        };
        info!(
            source = source.name(),
            resolution = %native,
            fps = self.configured.frame_rate,
            "capture started"
        );

        if let Ok(mut live) = self.live.lock() {
            *live = self.configured;
        }
        self.running.store(true, Ordering::SeqCst);

        let lease = SourceLease {
            source: Some(source),
            running: Arc::clone(&self.running),
        };
        let running = Arc::clone(&self.running);
        let live = Arc::clone(&self.live);
        let frames = Arc::clone(&self.frames);
        let callback: FrameCallback = Box::new(on_frame);

        let spawned = std::thread::Builder::new()
            .name("skylink-capture".into())
            .spawn(move || capture_loop(lease, callback, live, running, frames));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                // The closure (and its lease) was dropped, closing the source.
                self.running.store(false, Ordering::SeqCst);
                Err(SkyError::CaptureUnavailable(format!(
                    "failed to spawn capture thread: {e}"
                )))
            }
        }
    }

    /// Stop capturing. Idempotent; after return no further callbacks run.
    pub fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.join_worker();
        if was_running {
            info!(frames = self.frame_count(), "capture stopped");
        }
    }

    /// Change settings. While running the change applies from the next
    /// frame without restarting the source.
    pub fn update_configuration(&mut self, settings: CaptureSettings) -> Result<(), SkyError> {
        settings.validate()?;
        self.configured = settings;
        if let Ok(mut live) = self.live.lock() {
            *live = settings;
        }
        debug!(?settings, "capture configuration updated");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> CaptureSettings {
        self.configured
    }

    /// Frames delivered since construction.
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn join_worker(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        match handle.join() {
            Ok(source) => {
                if source.is_some() {
                    self.source = source;
                }
            }
            Err(_) => warn!("capture thread panicked; source was closed during unwinding"),
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut lease: SourceLease,
    mut on_frame: FrameCallback,
    live: Arc<Mutex<CaptureSettings>>,
    running: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
) -> Option<Box<dyn CaptureSource>> {
    let started = Instant::now();
    let mut applied: Option<CaptureSettings> = None;

    while running.load(Ordering::SeqCst) {
        let loop_start = Instant::now();
        let settings = match live.lock() {
            Ok(s) => *s,
            Err(_) => break,
        };
        let Some(source) = lease.source() else {
            break;
        };

        if let Some(prev) = applied {
            if prev.resolution != settings.resolution {
                source.set_resolution(settings.resolution);
            }
        }
        applied = Some(settings);

        let interval = settings.frame_interval();
        let grabbed = source.grab(interval.min(MAX_GRAB_TIMEOUT));
        match grabbed {
            Ok(Some(raw)) => match raw.into_captured(settings.region, started.elapsed()) {
                Ok(frame) => {
                    frames.fetch_add(1, Ordering::Relaxed);
                    on_frame(frame);
                }
                Err(e) => debug!(error = %e, "dropping malformed source frame"),
            },
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "capture source failed; stopping capture");
                running.store(false, Ordering::SeqCst);
                break;
            }
        }

        pace(loop_start, interval);
    }

    lease.release()
}

/// Sleep for the remainder of the frame interval.
fn pace(loop_start: Instant, interval: Duration) {
    let elapsed = loop_start.elapsed();
    if elapsed < interval {
        std::thread::sleep(interval - elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use std::sync::mpsc;

    fn engine() -> (CaptureEngine, Arc<std::sync::atomic::AtomicUsize>) {
        let src = SyntheticSource::new(Resolution::new(64, 32));
        let handles = src.open_handles();
        (CaptureEngine::new(Box::new(src)), handles)
    }

    #[test]
    fn configure_rejects_zero_values() {
        let (mut e, _) = engine();
        assert_err!(e.configure(Resolution::new(0, 10), 30, None));
        assert_err!(e.configure(Resolution::new(64, 32), 0, None));
        assert_ok!(e.configure(Resolution::new(64, 32), 60, None));
    }

    #[test]
    fn start_delivers_frames_and_stop_releases_source() {
        let (mut e, handles) = engine();
        e.configure(Resolution::new(64, 32), 120, None).unwrap();
        let (tx, rx) = mpsc::channel();
        e.start(move |f| {
            let _ = tx.send(f.pts);
        })
        .unwrap();
        assert_eq!(handles.load(Ordering::SeqCst), 1);

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(second > first);

        e.stop();
        e.stop();
        assert!(!e.is_running());
        assert_eq!(handles.load(Ordering::SeqCst), 0);

        // Nothing arrives after stop returns.
        while rx.try_recv().is_ok() {}
        std::thread::sleep(Duration::from_millis(30));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn double_start_is_rejected() {
        let (mut e, _) = engine();
        e.start(|_| {}).unwrap();
        assert!(matches!(e.start(|_| {}), Err(SkyError::AlreadyCapturing)));
        e.stop();
        // Restart reuses the returned source.
        e.start(|_| {}).unwrap();
        e.stop();
    }

    #[test]
    fn unavailable_display() {
        let mut e = CaptureEngine::new(Box::new(SyntheticSource::unavailable()));
        assert!(matches!(
            e.start(|_| {}),
            Err(SkyError::CaptureUnavailable(_))
        ));
        assert!(!e.is_running());
    }

    #[test]
    fn live_update_changes_next_frames() {
        let (mut e, _) = engine();
        e.configure(Resolution::new(64, 32), 120, None).unwrap();
        let (tx, rx) = mpsc::channel();
        e.start(move |f| {
            let _ = tx.send(f.resolution());
        })
        .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Resolution::new(64, 32)
        );

        let region = CaptureRegion {
            x: 0,
            y: 0,
            width: 16,
            height: 8,
        };
        e.update_configuration(CaptureSettings {
            resolution: Resolution::new(64, 32),
            frame_rate: 120,
            region: Some(region),
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut saw_crop = false;
        while Instant::now() < deadline {
            if let Ok(res) = rx.recv_timeout(Duration::from_millis(200)) {
                if res == Resolution::new(16, 8) {
                    saw_crop = true;
                    break;
                }
            }
        }
        e.stop();
        assert!(saw_crop);
    }

    #[test]
    fn panicking_callback_still_closes_source() {
        let (mut e, handles) = engine();
        e.configure(Resolution::new(64, 32), 120, None).unwrap();
        e.start(|_| panic!("consumer crashed")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while handles.load(Ordering::SeqCst) != 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handles.load(Ordering::SeqCst), 0);
        e.stop();
    }
}
