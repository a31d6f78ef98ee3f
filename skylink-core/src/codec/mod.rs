//! Length-prefixed framing for `tokio_util` I/O.
//!
//! ```text
//! ┌──────────────────┬──────────┬─────────────────────┐
//! │ length: u32 (BE) │ type: u8 │ payload: [u8; len]  │
//! └──────────────────┴──────────┴─────────────────────┘
//! ```
//!
//! Message boundaries come from the length prefix alone. A length above
//! [`MAX_PAYLOAD_SIZE`] or an unknown type tag is fatal: the stream cannot
//! be resynchronised, so the decoder errors and the connection closes.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::SkyError;
use crate::message::MessageType;
use crate::packet::{FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, Packet};

/// Codec for [`Packet`] frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = SkyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(SkyError::FrameTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let kind = MessageType::try_from(src[4])?;

        let total = FRAME_HEADER_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(len).freeze();
        Packet::new(kind, payload).map(Some)
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = SkyError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.payload();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SkyError::FrameTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        dst.reserve(FRAME_HEADER_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_u8(item.kind() as u8);
        dst.extend_from_slice(payload);
        Ok(())
    }
}
