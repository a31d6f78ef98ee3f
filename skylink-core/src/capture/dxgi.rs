//! DXGI Desktop Duplication source for Windows.
//!
//! Uses the Direct3D 11 Desktop Duplication API to obtain GPU-backed
//! desktop frames, then copies them through a CPU-readable staging
//! texture.
//!
//! # Platform
//!
//! Windows-only. Elsewhere [`DxgiSource::open`] fails with
//! [`SkyError::CaptureUnavailable`].

use std::time::Duration;

use crate::capture::source::CaptureSource;
use crate::capture::types::{Resolution, SourceFrame};
use crate::error::SkyError;

/// Desktop Duplication capture of one monitor.
pub struct DxgiSource {
    monitor_index: u32,
    #[cfg(target_os = "windows")]
    duplication: Option<platform::Duplication>,
}

impl DxgiSource {
    /// Capture monitor `monitor_index` (0 = primary).
    pub fn new(monitor_index: u32) -> Self {
        Self {
            monitor_index,
            #[cfg(target_os = "windows")]
            duplication: None,
        }
    }
}

// ── Windows implementation ───────────────────────────────────────

#[cfg(target_os = "windows")]
mod platform {
    use super::*;
    use crate::capture::types::PixelFormat;
    use windows::{
        Win32::Graphics::{
            Direct3D::D3D_DRIVER_TYPE_HARDWARE,
            Direct3D11::*,
            Dxgi::{Common::*, *},
        },
        core::Interface,
    };

    fn unavailable(what: &str, e: impl std::fmt::Display) -> SkyError {
        SkyError::CaptureUnavailable(format!("{what}: {e}"))
    }

    /// Live COM handles for one duplicated output. Dropping releases them.
    pub(super) struct Duplication {
        width: u32,
        height: u32,
        context: ID3D11DeviceContext,
        duplication: IDXGIOutputDuplication,
        staging: ID3D11Texture2D,
    }

    // SAFETY: the handles move to the capture thread once and are only
    // used from there afterwards.
    unsafe impl Send for Duplication {}

    impl Duplication {
        pub(super) fn open(monitor_index: u32) -> Result<Self, SkyError> {
            unsafe { Self::open_inner(monitor_index) }
        }

        unsafe fn open_inner(monitor_index: u32) -> Result<Self, SkyError> {
            let mut device = None;
            let mut context = None;
            unsafe {
                D3D11CreateDevice(
                    None,
                    D3D_DRIVER_TYPE_HARDWARE,
                    None,
                    D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                    None,
                    D3D11_SDK_VERSION,
                    Some(&mut device),
                    None,
                    Some(&mut context),
                )
                .map_err(|e| unavailable("D3D11CreateDevice", e))?;
            }
            let device: ID3D11Device =
                device.ok_or_else(|| unavailable("D3D11CreateDevice", "no device"))?;
            let context =
                context.ok_or_else(|| unavailable("D3D11CreateDevice", "no context"))?;

            // Device → Adapter → Output → Duplication.
            let dxgi_device: IDXGIDevice =
                device.cast().map_err(|e| unavailable("IDXGIDevice", e))?;
            let adapter = unsafe { dxgi_device.GetAdapter() }
                .map_err(|e| unavailable("GetAdapter", e))?;
            let output: IDXGIOutput = unsafe { adapter.EnumOutputs(monitor_index) }
                .map_err(|e| unavailable(&format!("EnumOutputs({monitor_index})"), e))?;
            let output1: IDXGIOutput1 =
                output.cast().map_err(|e| unavailable("IDXGIOutput1", e))?;
            let duplication = unsafe { output1.DuplicateOutput(&device) }
                .map_err(|e| unavailable("DuplicateOutput", e))?;

            let desc = unsafe { duplication.GetDesc() };
            let width = desc.ModeDesc.Width;
            let height = desc.ModeDesc.Height;

            let staging_desc = D3D11_TEXTURE2D_DESC {
                Width: width,
                Height: height,
                MipLevels: 1,
                ArraySize: 1,
                Format: DXGI_FORMAT_B8G8R8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Usage: D3D11_USAGE_STAGING,
                BindFlags: 0,
                CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
                MiscFlags: 0,
            };
            let mut staging = None;
            unsafe { device.CreateTexture2D(&staging_desc, None, Some(&mut staging)) }
                .map_err(|e| unavailable("CreateTexture2D", e))?;
            let staging = staging.ok_or_else(|| unavailable("CreateTexture2D", "no texture"))?;

            Ok(Self {
                width,
                height,
                context,
                duplication,
                staging,
            })
        }

        pub(super) fn resolution(&self) -> Resolution {
            Resolution::new(self.width, self.height)
        }

        pub(super) fn grab(&mut self, timeout: Duration) -> Result<Option<SourceFrame>, SkyError> {
            unsafe { self.grab_inner(timeout.as_millis() as u32) }
        }

        unsafe fn grab_inner(&mut self, timeout_ms: u32) -> Result<Option<SourceFrame>, SkyError> {
            let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
            let mut resource = None;

            match unsafe {
                self.duplication
                    .AcquireNextFrame(timeout_ms, &mut info, &mut resource)
            } {
                Ok(()) => {}
                Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(None),
                Err(e) => return Err(unavailable("AcquireNextFrame", e)),
            }

            let resource = match resource {
                Some(r) => r,
                None => {
                    let _ = unsafe { self.duplication.ReleaseFrame() };
                    return Err(unavailable("AcquireNextFrame", "no resource"));
                }
            };
            let texture: ID3D11Texture2D = match resource.cast() {
                Ok(t) => t,
                Err(e) => {
                    let _ = unsafe { self.duplication.ReleaseFrame() };
                    return Err(unavailable("ID3D11Texture2D", e));
                }
            };

            unsafe { self.context.CopyResource(&self.staging, &texture) };
            // Hand the desktop image back to the compositor early.
            let _ = unsafe { self.duplication.ReleaseFrame() };

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            unsafe {
                self.context
                    .Map(&self.staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
            }
            .map_err(|e| unavailable("Map", e))?;

            let stride = mapped.RowPitch;
            let len = stride as usize * self.height as usize;
            let data =
                unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, len) }.to_vec();
            unsafe { self.context.Unmap(&self.staging, 0) };

            Ok(Some(SourceFrame {
                width: self.width,
                height: self.height,
                stride,
                format: PixelFormat::Bgra8,
                data,
            }))
        }
    }

    impl CaptureSource for DxgiSource {
        fn name(&self) -> &str {
            "dxgi"
        }

        fn open(&mut self, _requested: Resolution) -> Result<Resolution, SkyError> {
            if let Some(dup) = &self.duplication {
                return Ok(dup.resolution());
            }
            let dup = Duplication::open(self.monitor_index)?;
            let res = dup.resolution();
            self.duplication = Some(dup);
            Ok(res)
        }

        fn grab(&mut self, timeout: Duration) -> Result<Option<SourceFrame>, SkyError> {
            match self.duplication.as_mut() {
                Some(dup) => dup.grab(timeout),
                None => Err(SkyError::CaptureUnavailable("duplication not open".into())),
            }
        }

        fn close(&mut self) {
            self.duplication = None;
        }
    }
}

// ── Other platforms ──────────────────────────────────────────────

#[cfg(not(target_os = "windows"))]
impl CaptureSource for DxgiSource {
    fn name(&self) -> &str {
        "dxgi"
    }

    fn open(&mut self, _requested: Resolution) -> Result<Resolution, SkyError> {
        Err(SkyError::CaptureUnavailable(format!(
            "DXGI Desktop Duplication (monitor {}) is only available on Windows",
            self.monitor_index
        )))
    }

    fn grab(&mut self, _timeout: Duration) -> Result<Option<SourceFrame>, SkyError> {
        Err(SkyError::CaptureUnavailable("not supported on this platform".into()))
    }

    fn close(&mut self) {}
}
