//! Wire message type tags.
//!
//! Unknown tag values map to an error through `TryFrom`.
//! An unknown tag is a framing desync and closes the connection.

use crate::error::SkyError;
use std::fmt;

// ── MessageType ──────────────────────────────────────────────────

/// The 1-byte type tag that follows the length prefix of every frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Encoded video access unit (host → viewer).
    VideoPacket = 0x01,
    /// Mouse input event (viewer → host).
    InputMouse = 0x02,
    /// Keyboard input event (viewer → host).
    InputKeyboard = 0x03,
    /// Control traffic: handshake, heartbeat, keyframe requests.
    Control = 0x04,
    /// Any of the above, encrypted with the session keys. The payload is
    /// `[u64 counter][AES-GCM ciphertext of [inner tag][inner payload]]`.
    Sealed = 0x05,
}

impl TryFrom<u8> for MessageType {
    type Error = SkyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::VideoPacket),
            0x02 => Ok(MessageType::InputMouse),
            0x03 => Ok(MessageType::InputKeyboard),
            0x04 => Ok(MessageType::Control),
            0x05 => Ok(MessageType::Sealed),
            _ => Err(SkyError::UnknownVariant {
                type_name: "MessageType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::VideoPacket => write!(f, "video"),
            MessageType::InputMouse => write!(f, "mouse"),
            MessageType::InputKeyboard => write!(f, "keyboard"),
            MessageType::Control => write!(f, "control"),
            MessageType::Sealed => write!(f, "sealed"),
        }
    }
}

impl MessageType {
    /// Input events are delivered to the injector in arrival order.
    pub fn is_input(&self) -> bool {
        matches!(self, MessageType::InputMouse | MessageType::InputKeyboard)
    }
}
