//! Input events sent from the viewer to the host.
//!
//! ```text
//! Viewer ──[InputMouse]──────────────────────► Host
//!   Payload: MouseEvent (bincode)
//!
//! Viewer ──[InputKeyboard]───────────────────► Host
//!   Payload: KeyEvent (bincode)
//! ```
//!
//! Coordinates are in the host's captured-region pixel space.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::SkyError;
use crate::message::MessageType;
use crate::packet::Packet;

// ── Mouse Input ───────────────────────────────────────────────────

/// Mouse input event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MouseEvent {
    pub x: i32,
    pub y: i32,
    pub kind: MouseEventKind,
    /// Which button (if applicable).
    pub button: MouseButton,
    /// Vertical wheel delta (positive = away from the user).
    pub wheel_delta: i16,
    /// Horizontal wheel delta.
    pub hwheel_delta: i16,
}

impl MouseEvent {
    pub fn move_to(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            kind: MouseEventKind::Move,
            button: MouseButton::None,
            wheel_delta: 0,
            hwheel_delta: 0,
        }
    }

    pub fn press(x: i32, y: i32, button: MouseButton) -> Self {
        Self {
            kind: MouseEventKind::Press,
            button,
            ..Self::move_to(x, y)
        }
    }

    pub fn release(x: i32, y: i32, button: MouseButton) -> Self {
        Self {
            kind: MouseEventKind::Release,
            button,
            ..Self::move_to(x, y)
        }
    }

    pub fn scroll(x: i32, y: i32, wheel_delta: i16, hwheel_delta: i16) -> Self {
        Self {
            kind: MouseEventKind::Scroll,
            wheel_delta,
            hwheel_delta,
            ..Self::move_to(x, y)
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SkyError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SkyError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn into_packet(self) -> Result<Packet, SkyError> {
        Packet::new(MessageType::InputMouse, self.to_bytes()?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MouseEventKind {
    Move,
    Press,
    Release,
    Scroll,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MouseButton {
    None,
    Left,
    Right,
    Middle,
    X1,
    X2,
}

// ── Keyboard Input ────────────────────────────────────────────────

bitflags! {
    /// Modifier keys held while a key event was generated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Modifiers: u8 {
        const SHIFT = 0x01;
        const CTRL = 0x02;
        const ALT = 0x04;
        const META = 0x08;
        const CAPS_LOCK = 0x10;
    }
}

/// Keyboard input event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct KeyEvent {
    /// Platform-neutral USB HID usage code.
    pub usage: u16,
    /// Hardware scan code, when the viewer knows it.
    pub scan_code: u16,
    pub action: KeyAction,
    pub modifiers: Modifiers,
    /// Scan code carries the 0xE0 extended prefix.
    pub extended: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyAction {
    Press,
    Release,
}

impl KeyEvent {
    pub fn press(usage: u16, scan_code: u16, modifiers: Modifiers) -> Self {
        Self {
            usage,
            scan_code,
            action: KeyAction::Press,
            modifiers,
            extended: scan_code > 0xFF,
        }
    }

    pub fn release(usage: u16, scan_code: u16, modifiers: Modifiers) -> Self {
        Self {
            action: KeyAction::Release,
            ..Self::press(usage, scan_code, modifiers)
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SkyError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SkyError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn into_packet(self) -> Result<Packet, SkyError> {
        Packet::new(MessageType::InputKeyboard, self.to_bytes()?)
    }
}

// ── InputEvent ────────────────────────────────────────────────────

/// Either kind of input event, as handed to the injector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Mouse(MouseEvent),
    Key(KeyEvent),
}

impl InputEvent {
    pub fn into_packet(self) -> Result<Packet, SkyError> {
        match self {
            InputEvent::Mouse(m) => m.into_packet(),
            InputEvent::Key(k) => k.into_packet(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_event_roundtrip() {
        let events = [
            MouseEvent::move_to(100, 200),
            MouseEvent::press(100, 200, MouseButton::Left),
            MouseEvent::release(100, 200, MouseButton::Left),
            MouseEvent::scroll(100, 200, -120, 0),
        ];

        for event in events {
            let bytes = event.to_bytes().unwrap();
            assert_eq!(MouseEvent::from_bytes(&bytes).unwrap(), event);
        }
    }

    #[test]
    fn key_event_modifiers() {
        let event = KeyEvent::press(0x04, 0x1E, Modifiers::SHIFT | Modifiers::CTRL);
        let decoded = KeyEvent::from_bytes(&event.to_bytes().unwrap()).unwrap();

        assert_eq!(event, decoded);
        assert!(decoded.modifiers.contains(Modifiers::SHIFT));
        assert!(!decoded.modifiers.contains(Modifiers::ALT));
    }

    #[test]
    fn extended_scan_code_detected() {
        let event = KeyEvent::release(0x4F, 0xE04D, Modifiers::empty());
        assert!(event.extended);
        assert_eq!(event.action, KeyAction::Release);
    }

    #[test]
    fn packets_carry_the_right_tag() {
        let m = MouseEvent::press(5, 5, MouseButton::Right).into_packet().unwrap();
        assert_eq!(m.kind(), MessageType::InputMouse);
        let k = KeyEvent::press(0x28, 0x1C, Modifiers::empty())
            .into_packet()
            .unwrap();
        assert_eq!(k.kind(), MessageType::InputKeyboard);
    }
}
