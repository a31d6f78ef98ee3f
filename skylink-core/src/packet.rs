//! A single framed message: type tag plus opaque payload.
//!
//! On the wire a packet occupies `[u32 BE length][u8 type][payload]`,
//! where `length` counts payload bytes only. See [`crate::codec`].

use bytes::Bytes;

use crate::error::SkyError;
use crate::message::MessageType;

/// Length prefix (4) + type tag (1).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Largest payload a single frame may carry (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// A typed application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: MessageType,
    payload: Bytes,
}

impl Packet {
    /// Build a packet, rejecting payloads above [`MAX_PAYLOAD_SIZE`].
    pub fn new(kind: MessageType, payload: impl Into<Bytes>) -> Result<Self, SkyError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SkyError::FrameTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self { kind, payload })
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Bytes this packet occupies on the wire, header included.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}
