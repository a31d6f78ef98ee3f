//! Collaborators the server delegates to: peer authorization and local
//! input injection.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SkyError;
use crate::protocol::{InputEvent, PeerIdentity};

// ── Authorization ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(String),
}

/// Policy hook consulted for every Hello before a session is created.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerAuthorizer: Send + Sync {
    async fn authorize(&self, peer: &PeerIdentity, addr: Option<SocketAddr>) -> AuthDecision;
}

/// Accepts peers by device id or key fingerprint.
#[derive(Debug, Clone, Default)]
pub struct AllowListAuthorizer {
    allow_any: bool,
    devices: HashSet<Uuid>,
    fingerprints: HashSet<String>,
}

impl AllowListAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept every peer. Intended for trusted LANs and tests.
    pub fn allow_any() -> Self {
        Self {
            allow_any: true,
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device_id: Uuid) -> Self {
        self.devices.insert(device_id);
        self
    }

    pub fn with_fingerprint(mut self, fp: impl Into<String>) -> Self {
        self.fingerprints.insert(fp.into().to_ascii_lowercase());
        self
    }
}

#[async_trait]
impl PeerAuthorizer for AllowListAuthorizer {
    async fn authorize(&self, peer: &PeerIdentity, addr: Option<SocketAddr>) -> AuthDecision {
        if self.allow_any || self.devices.contains(&peer.device_id) {
            return AuthDecision::Allow;
        }
        let fp_known = peer
            .pub_key_fp
            .as_deref()
            .is_some_and(|fp| self.fingerprints.contains(&fp.to_ascii_lowercase()));
        if fp_known {
            return AuthDecision::Allow;
        }
        info!(device = %peer.device_id, name = %peer.name, ?addr, "peer not on allow list");
        AuthDecision::Deny(format!("device {} is not allowed", peer.device_id))
    }
}

// ── Input injection ──────────────────────────────────────────────

/// Applies decoded input events to the local OS, in the order given.
pub trait InputInjector: Send + Sync {
    fn inject(&self, event: &InputEvent) -> Result<(), SkyError>;
}

/// Logs and counts events without touching the OS.
#[derive(Debug, Default)]
pub struct LoggingInjector {
    injected: AtomicU64,
}

impl LoggingInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }
}

impl InputInjector for LoggingInjector {
    fn inject(&self, event: &InputEvent) -> Result<(), SkyError> {
        self.injected.fetch_add(1, Ordering::Relaxed);
        debug!(?event, "input event");
        Ok(())
    }
}

#[cfg(target_os = "windows")]
pub use platform::SendInputInjector;

/// The injector for this OS: `SendInput` on Windows, logging elsewhere.
pub fn platform_injector() -> std::sync::Arc<dyn InputInjector> {
    #[cfg(target_os = "windows")]
    {
        std::sync::Arc::new(SendInputInjector::new())
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::sync::Arc::new(LoggingInjector::new())
    }
}

#[cfg(target_os = "windows")]
mod platform {
    use super::*;
    use crate::protocol::{KeyAction, KeyEvent, MouseButton, MouseEvent, MouseEventKind};
    use windows::Win32::UI::Input::KeyboardAndMouse::*;
    use windows::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

    /// Win32 `SendInput`. The process must run on the interactive desktop.
    #[derive(Debug, Default)]
    pub struct SendInputInjector;

    impl SendInputInjector {
        pub fn new() -> Self {
            Self
        }

        fn send(input: INPUT, what: &str) -> Result<(), SkyError> {
            let sent = unsafe { SendInput(&[input], std::mem::size_of::<INPUT>() as i32) };
            if sent == 0 {
                return Err(SkyError::Other(format!("SendInput ({what}) returned 0")));
            }
            Ok(())
        }

        fn mouse(&self, event: &MouseEvent) -> Result<(), SkyError> {
            let (screen_w, screen_h) =
                unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
            if screen_w <= 0 || screen_h <= 0 {
                return Err(SkyError::Other("GetSystemMetrics returned 0".into()));
            }
            // Absolute coordinates are normalised to 0..=65535.
            let dx = (event.x as i64 * 65535 / screen_w as i64) as i32;
            let dy = (event.y as i64 * 65535 / screen_h as i64) as i32;

            let mut flags = MOUSEEVENTF_ABSOLUTE;
            let mut data: i32 = 0;
            match event.kind {
                MouseEventKind::Move => flags |= MOUSEEVENTF_MOVE,
                MouseEventKind::Press | MouseEventKind::Release => {
                    let down = event.kind == MouseEventKind::Press;
                    flags |= match (event.button, down) {
                        (MouseButton::Left, true) => MOUSEEVENTF_LEFTDOWN,
                        (MouseButton::Left, false) => MOUSEEVENTF_LEFTUP,
                        (MouseButton::Right, true) => MOUSEEVENTF_RIGHTDOWN,
                        (MouseButton::Right, false) => MOUSEEVENTF_RIGHTUP,
                        (MouseButton::Middle, true) => MOUSEEVENTF_MIDDLEDOWN,
                        (MouseButton::Middle, false) => MOUSEEVENTF_MIDDLEUP,
                        (MouseButton::X1, true) | (MouseButton::X2, true) => {
                            data = if event.button == MouseButton::X1 { 1 } else { 2 };
                            MOUSEEVENTF_XDOWN
                        }
                        (MouseButton::X1, false) | (MouseButton::X2, false) => {
                            data = if event.button == MouseButton::X1 { 1 } else { 2 };
                            MOUSEEVENTF_XUP
                        }
                        (MouseButton::None, _) => MOUSEEVENTF_MOVE,
                    };
                }
                MouseEventKind::Scroll => {
                    if event.hwheel_delta != 0 {
                        let hflags = MOUSEEVENTF_HWHEEL | MOUSEEVENTF_ABSOLUTE;
                        self.mouse_raw(dx, dy, hflags, event.hwheel_delta as i32)?;
                    }
                    if event.wheel_delta == 0 {
                        return Ok(());
                    }
                    flags |= MOUSEEVENTF_WHEEL;
                    data = event.wheel_delta as i32;
                }
            }
            self.mouse_raw(dx, dy, flags, data)
        }

        fn mouse_raw(
            &self,
            dx: i32,
            dy: i32,
            flags: MOUSE_EVENT_FLAGS,
            data: i32,
        ) -> Result<(), SkyError> {
            Self::send(
                INPUT {
                    r#type: INPUT_MOUSE,
                    Anonymous: INPUT_0 {
                        mi: MOUSEINPUT {
                            dx,
                            dy,
                            mouseData: data as u32,
                            dwFlags: flags,
                            time: 0,
                            dwExtraInfo: 0,
                        },
                    },
                },
                "mouse",
            )
        }

        fn key(&self, event: &KeyEvent) -> Result<(), SkyError> {
            if event.scan_code == 0 {
                return Err(SkyError::Other(format!(
                    "key usage {:#06x} has no scan code",
                    event.usage
                )));
            }
            let mut flags = KEYEVENTF_SCANCODE;
            if event.action == KeyAction::Release {
                flags |= KEYEVENTF_KEYUP;
            }
            if event.extended {
                flags |= KEYEVENTF_EXTENDEDKEY;
            }
            Self::send(
                INPUT {
                    r#type: INPUT_KEYBOARD,
                    Anonymous: INPUT_0 {
                        ki: KEYBDINPUT {
                            wVk: VIRTUAL_KEY(0),
                            wScan: event.scan_code & 0xFF,
                            dwFlags: flags,
                            time: 0,
                            dwExtraInfo: 0,
                        },
                    },
                },
                "keyboard",
            )
        }
    }

    impl InputInjector for SendInputInjector {
        fn inject(&self, event: &InputEvent) -> Result<(), SkyError> {
            match event {
                InputEvent::Mouse(m) => self.mouse(m),
                InputEvent::Key(k) => self.key(k),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MouseEvent;

    fn peer(fp: Option<&str>) -> PeerIdentity {
        PeerIdentity {
            device_id: Uuid::new_v4(),
            name: "laptop".into(),
            platform: "linux".into(),
            pub_key_fp: fp.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn allow_list_by_device_and_fingerprint() {
        let known = peer(None);
        let auth = AllowListAuthorizer::new()
            .with_device(known.device_id)
            .with_fingerprint("ABCD");

        assert_eq!(auth.authorize(&known, None).await, AuthDecision::Allow);
        assert_eq!(
            auth.authorize(&peer(Some("abcd")), None).await,
            AuthDecision::Allow
        );
        assert!(matches!(
            auth.authorize(&peer(Some("ffff")), None).await,
            AuthDecision::Deny(_)
        ));
        assert!(matches!(
            auth.authorize(&peer(None), None).await,
            AuthDecision::Deny(_)
        ));
    }

    #[tokio::test]
    async fn allow_any_accepts_strangers() {
        let auth = AllowListAuthorizer::allow_any();
        assert_eq!(auth.authorize(&peer(None), None).await, AuthDecision::Allow);
    }

    #[tokio::test]
    async fn mocked_authorizer() {
        let mut mock = MockPeerAuthorizer::new();
        mock.expect_authorize()
            .times(1)
            .returning(|_, _| AuthDecision::Deny("maintenance".into()));
        assert_eq!(
            mock.authorize(&peer(None), None).await,
            AuthDecision::Deny("maintenance".into())
        );
    }

    #[test]
    fn logging_injector_counts() {
        let inj = LoggingInjector::new();
        inj.inject(&InputEvent::Mouse(MouseEvent::move_to(1, 2)))
            .unwrap();
        assert_eq!(inj.injected(), 1);
    }
}
