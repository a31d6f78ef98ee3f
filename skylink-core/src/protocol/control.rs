//! Control-channel messages: handshake, liveness, keyframe requests.
//!
//! ## Handshake
//! ```text
//! Dialer ──[Control: Hello]──────────────────► Acceptor
//! Dialer ◄─[Control: HelloAck]─────────────── Acceptor
//! ```
//!
//! ## Liveness
//! ```text
//! Either ──[Control: Heartbeat{seq}]─────────► Peer
//! Either ◄─[Control: HeartbeatAck{seq}]─────── Peer
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SkyError;
use crate::message::MessageType;
use crate::packet::Packet;

bitflags! {
    /// Features a peer supports, exchanged during the Hello handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capabilities: u32 {
        const SCREEN_CAPTURE = 0x0001;
        const INPUT_INJECTION = 0x0002;
        const H264 = 0x0010;
        const HEVC = 0x0020;
        const RAW_IMAGE = 0x0040;
        const RELAY = 0x0100;
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::SCREEN_CAPTURE
            | Capabilities::INPUT_INJECTION
            | Capabilities::H264
            | Capabilities::HEVC
            | Capabilities::RAW_IMAGE
    }
}

impl Capabilities {
    /// Negotiate by taking the intersection of both peers.
    pub fn negotiate(self, remote: Self) -> Self {
        self & remote
    }

    /// Names used in the service advertisement's capability list.
    pub fn names(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        for (flag, name) in [
            (Capabilities::SCREEN_CAPTURE, "screen"),
            (Capabilities::INPUT_INJECTION, "input"),
            (Capabilities::H264, "h264"),
            (Capabilities::HEVC, "hevc"),
            (Capabilities::RAW_IMAGE, "raw"),
            (Capabilities::RELAY, "relay"),
        ] {
            if self.contains(flag) {
                out.push(name);
            }
        }
        out
    }
}

/// Identity a peer presents in its Hello.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerIdentity {
    pub device_id: Uuid,
    pub name: String,
    pub platform: String,
    /// Hex fingerprint of the peer's public key, if it has one.
    pub pub_key_fp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    Hello {
        identity: PeerIdentity,
        capabilities: Capabilities,
        /// Ephemeral P-256 public key; `None` asks for a plaintext session.
        key_share: Option<Vec<u8>>,
    },
    HelloAck {
        accepted: bool,
        session_id: Option<Uuid>,
        capabilities: Capabilities,
        reason: Option<String>,
        key_share: Option<Vec<u8>>,
    },
    Heartbeat {
        seq: u64,
        sent_at_us: u64,
    },
    HeartbeatAck {
        seq: u64,
        sent_at_us: u64,
    },
    /// Ask the host to emit a keyframe (decoder lost sync).
    RequestKeyframe,
    /// Graceful disconnect.
    Goodbye {
        reason: String,
    },
}

impl ControlMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SkyError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SkyError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn into_packet(self) -> Result<Packet, SkyError> {
        Packet::new(MessageType::Control, self.to_bytes()?)
    }

    /// Liveness traffic is handled inside the link and never surfaced.
    pub fn is_liveness(&self) -> bool {
        matches!(
            self,
            ControlMessage::Heartbeat { .. } | ControlMessage::HeartbeatAck { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> PeerIdentity {
        PeerIdentity {
            device_id: Uuid::new_v4(),
            name: "studio-mac".into(),
            platform: "macos".into(),
            pub_key_fp: Some("ab12".into()),
        }
    }

    #[test]
    fn hello_roundtrip() {
        let msg = ControlMessage::Hello {
            identity: identity(),
            capabilities: Capabilities::default(),
            key_share: Some(vec![4; 65]),
        };
        let decoded = ControlMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn capabilities_negotiate() {
        let local = Capabilities::default();
        let remote = Capabilities::SCREEN_CAPTURE | Capabilities::H264 | Capabilities::RELAY;
        let negotiated = local.negotiate(remote);
        assert!(negotiated.contains(Capabilities::H264));
        assert!(!negotiated.contains(Capabilities::HEVC));
        assert!(!negotiated.contains(Capabilities::RELAY));
    }

    #[test]
    fn capability_names() {
        let names = (Capabilities::H264 | Capabilities::HEVC).names();
        assert_eq!(names, vec!["h264", "hevc"]);
    }

    #[test]
    fn liveness_detection() {
        assert!(ControlMessage::Heartbeat { seq: 1, sent_at_us: 0 }.is_liveness());
        assert!(!ControlMessage::RequestKeyframe.is_liveness());
    }
}
