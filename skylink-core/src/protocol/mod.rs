//! Typed payloads carried inside [`Packet`] frames.
//!
//! Each sub-module defines the structured payload for one message type.
//! Payloads are serialized with `serde` + `bincode`.
//!
//! [`Packet`]: crate::packet::Packet

pub mod control;
pub mod input;
pub mod video;

pub use control::{Capabilities, ControlMessage, PeerIdentity};
pub use input::{InputEvent, KeyAction, KeyEvent, Modifiers, MouseButton, MouseEvent, MouseEventKind};
pub use video::VideoPayload;

use crate::error::SkyError;
use crate::message::MessageType;
use crate::packet::Packet;

/// A fully decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Video(VideoPayload),
    Input(InputEvent),
    Control(ControlMessage),
}

impl Message {
    /// Decode a packet's payload according to its type tag.
    pub fn decode(packet: &Packet) -> Result<Self, SkyError> {
        match packet.kind() {
            MessageType::VideoPacket => VideoPayload::from_bytes(packet.payload()).map(Message::Video),
            MessageType::InputMouse => {
                MouseEvent::from_bytes(packet.payload()).map(|e| Message::Input(InputEvent::Mouse(e)))
            }
            MessageType::InputKeyboard => {
                KeyEvent::from_bytes(packet.payload()).map(|e| Message::Input(InputEvent::Key(e)))
            }
            MessageType::Control => ControlMessage::from_bytes(packet.payload()).map(Message::Control),
            // Opened by the link before it reaches an owner.
            MessageType::Sealed => Err(SkyError::ProtocolViolation(
                "sealed packet outside the link".into(),
            )),
        }
    }
}
