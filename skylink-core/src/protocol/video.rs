//! Encoded video packets streamed from host to viewer.
//!
//! ```text
//! Host ──[VideoPacket]───────────────────────► Viewer   (repeated)
//!   Payload: VideoPayload (bincode)
//! ```
//!
//! `sequence` increases by one per emitted packet, so a viewer can detect
//! gaps left by backpressure drops and request a keyframe.

use serde::{Deserialize, Serialize};

use crate::encoder::{CodecTag, EncodedPacket};
use crate::error::SkyError;
use crate::message::MessageType;
use crate::packet::Packet;

/// Wire form of one encoded access unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoPayload {
    pub codec: CodecTag,
    pub width: u32,
    pub height: u32,
    pub is_keyframe: bool,
    pub sequence: u64,
    /// Presentation timestamp in microseconds since capture start.
    pub timestamp_us: u64,
    pub data: Vec<u8>,
}

impl VideoPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SkyError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SkyError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn into_packet(self) -> Result<Packet, SkyError> {
        Packet::new(MessageType::VideoPacket, self.to_bytes()?)
    }
}

impl From<&EncodedPacket> for VideoPayload {
    fn from(p: &EncodedPacket) -> Self {
        Self {
            codec: p.codec,
            width: p.width,
            height: p.height,
            is_keyframe: p.is_keyframe,
            sequence: p.sequence,
            timestamp_us: p.pts.as_micros() as u64,
            data: p.data.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn payload_survives_framing() {
        let payload = VideoPayload {
            codec: CodecTag::H264,
            width: 1280,
            height: 720,
            is_keyframe: true,
            sequence: 0,
            timestamp_us: 0,
            data: (0..=255u8).cycle().take(4096).collect(),
        };

        let mut wire = BytesMut::new();
        FrameCodec
            .encode(payload.clone().into_packet().unwrap(), &mut wire)
            .unwrap();
        assert_eq!(wire[4], MessageType::VideoPacket as u8);

        let packet = FrameCodec.decode(&mut wire).unwrap().unwrap();
        let decoded = VideoPayload::from_bytes(packet.payload()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn truncated_payload_is_an_encoding_error() {
        let bytes = VideoPayload {
            codec: CodecTag::Hevc,
            width: 2,
            height: 2,
            is_keyframe: false,
            sequence: 9,
            timestamp_us: 33_000,
            data: vec![1, 2, 3, 4],
        }
        .to_bytes()
        .unwrap();
        assert!(matches!(
            VideoPayload::from_bytes(&bytes[..bytes.len() - 2]),
            Err(SkyError::Encoding(_))
        ));
    }
}
