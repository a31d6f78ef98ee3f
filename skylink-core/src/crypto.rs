//! Session encryption: ephemeral P-256 key agreement, HKDF-SHA256 key
//! derivation and AES-256-GCM sealing.
//!
//! ```text
//!  initiator                                        responder
//!    │ ── Hello{key_share: A} ─────────────────────────► │
//!    │ ◄──────────────────────── HelloAck{key_share: B} ─ │
//!    │                                                    │
//!    │   shared = ECDH(a, B) = ECDH(b, A)                 │
//!    │   prk    = HKDF-Extract(salt = A ‖ B, shared)      │
//!    │   k_i→r  = HKDF-Expand(prk, INITIATOR_LABEL)       │
//!    │   k_r→i  = HKDF-Expand(prk, RESPONDER_LABEL)       │
//!    │                                                    │
//!    │ ══ Sealed{ctr, GCM(k_i→r, ctr, [tag][payload])} ══► │
//! ```
//!
//! The nonce is a per-direction counter sent in clear in front of the
//! ciphertext. Counters only grow, with gaps where the send queue
//! dropped a sealed frame, so a replayed or reordered frame fails.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use p256::PublicKey;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::OsRng;
use sha2::Sha256;

use crate::error::SkyError;
use crate::message::MessageType;
use crate::packet::Packet;

/// Uncompressed SEC1 encoding of a P-256 point.
pub const KEY_SHARE_LEN: usize = 65;

const COUNTER_LEN: usize = 8;
const INITIATOR_LABEL: &[u8] = b"skylink-session initiator->responder";
const RESPONDER_LABEL: &[u8] = b"skylink-session responder->initiator";

/// Which side of the Hello/HelloAck exchange this end played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the Hello.
    Initiator,
    /// Answered with the HelloAck.
    Responder,
}

// ── KeyExchange ──────────────────────────────────────────────────

/// One-shot ephemeral key pair for a single handshake.
pub struct KeyExchange {
    secret: EphemeralSecret,
    share: Vec<u8>,
}

impl KeyExchange {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let share = PublicKey::from(&secret)
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        Self { secret, share }
    }

    /// Public half, sent to the peer in Hello or HelloAck.
    pub fn key_share(&self) -> &[u8] {
        &self.share
    }

    /// Combine with the peer's share into the session keys. Consumes the
    /// ephemeral secret.
    pub fn agree(self, role: Role, peer_share: &[u8]) -> Result<SessionKeys, SkyError> {
        let peer = PublicKey::from_sec1_bytes(peer_share)
            .map_err(|_| SkyError::Crypto("invalid peer key share".into()))?;
        let shared = self.secret.diffie_hellman(&peer);

        let (initiator, responder) = match role {
            Role::Initiator => (self.share.as_slice(), peer_share),
            Role::Responder => (peer_share, self.share.as_slice()),
        };
        let salt = [initiator, responder].concat();
        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.raw_secret_bytes());

        let i2r = expand_cipher(&hk, INITIATOR_LABEL)?;
        let r2i = expand_cipher(&hk, RESPONDER_LABEL)?;
        let (outbound, inbound) = match role {
            Role::Initiator => (i2r, r2i),
            Role::Responder => (r2i, i2r),
        };
        Ok(SessionKeys {
            sealer: Sealer {
                cipher: outbound,
                counter: 0,
            },
            opener: Opener {
                cipher: inbound,
                next: 0,
            },
        })
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("share_len", &self.share.len())
            .finish_non_exhaustive()
    }
}

fn expand_cipher(hk: &Hkdf<Sha256>, label: &[u8]) -> Result<Aes256Gcm, SkyError> {
    let mut key = [0u8; 32];
    hk.expand(label, &mut key)
        .map_err(|e| SkyError::Crypto(format!("hkdf expand failed: {e}")))?;
    Aes256Gcm::new_from_slice(&key).map_err(|e| SkyError::Crypto(format!("aead key init failed: {e}")))
}

fn nonce(counter: u64) -> [u8; 12] {
    let mut n = [0u8; 12];
    n[4..].copy_from_slice(&counter.to_be_bytes());
    n
}

// ── SessionKeys ──────────────────────────────────────────────────

/// Directional keys of one session.
pub struct SessionKeys {
    sealer: Sealer,
    opener: Opener,
}

impl SessionKeys {
    pub fn split(self) -> (Sealer, Opener) {
        (self.sealer, self.opener)
    }
}

/// Encrypts outbound packets.
pub struct Sealer {
    cipher: Aes256Gcm,
    counter: u64,
}

impl Sealer {
    /// Wrap `packet` in a `Sealed` frame under the next counter.
    pub fn seal(&mut self, packet: &Packet) -> Result<Packet, SkyError> {
        let counter = self.counter;
        self.counter = counter
            .checked_add(1)
            .ok_or_else(|| SkyError::Crypto("nonce space exhausted".into()))?;

        let mut plain = Vec::with_capacity(1 + packet.payload().len());
        plain.push(packet.kind() as u8);
        plain.extend_from_slice(packet.payload());
        let sealed = self
            .cipher
            .encrypt(Nonce::<U12>::from_slice(&nonce(counter)), plain.as_slice())
            .map_err(|_| SkyError::Crypto("encryption failed".into()))?;

        let mut payload = Vec::with_capacity(COUNTER_LEN + sealed.len());
        payload.extend_from_slice(&counter.to_be_bytes());
        payload.extend_from_slice(&sealed);
        Packet::new(MessageType::Sealed, payload)
    }
}

/// Decrypts and authenticates inbound `Sealed` frames.
pub struct Opener {
    cipher: Aes256Gcm,
    next: u64,
}

impl Opener {
    /// Recover the inner packet. Fails on tampering, replay and nesting.
    pub fn open(&mut self, packet: &Packet) -> Result<Packet, SkyError> {
        if packet.kind() != MessageType::Sealed {
            return Err(SkyError::ProtocolViolation(format!(
                "expected sealed frame, got {}",
                packet.kind()
            )));
        }
        let payload = packet.payload();
        if payload.len() < COUNTER_LEN {
            return Err(SkyError::Crypto("sealed frame too short".into()));
        }
        let (head, body) = payload.split_at(COUNTER_LEN);
        let mut counter = [0u8; COUNTER_LEN];
        counter.copy_from_slice(head);
        let counter = u64::from_be_bytes(counter);
        if counter < self.next {
            return Err(SkyError::Crypto(format!(
                "replayed frame: counter {counter}, expected at least {}",
                self.next
            )));
        }

        let plain = self
            .cipher
            .decrypt(Nonce::<U12>::from_slice(&nonce(counter)), body)
            .map_err(|_| SkyError::Crypto("sealed frame failed authentication".into()))?;
        self.next = counter
            .checked_add(1)
            .ok_or_else(|| SkyError::Crypto("nonce space exhausted".into()))?;

        let (&tag, inner) = plain
            .split_first()
            .ok_or_else(|| SkyError::Crypto("empty sealed frame".into()))?;
        let kind = MessageType::try_from(tag)?;
        if kind == MessageType::Sealed {
            return Err(SkyError::ProtocolViolation("nested sealed frame".into()));
        }
        Packet::new(kind, inner.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SessionKeys, SessionKeys) {
        let initiator = KeyExchange::new();
        let responder = KeyExchange::new();
        let a_share = initiator.key_share().to_vec();
        let b_share = responder.key_share().to_vec();
        (
            initiator.agree(Role::Initiator, &b_share).unwrap(),
            responder.agree(Role::Responder, &a_share).unwrap(),
        )
    }

    fn control(byte: u8) -> Packet {
        Packet::new(MessageType::Control, vec![byte; 40]).unwrap()
    }

    #[test]
    fn key_share_is_uncompressed_point() {
        let kx = KeyExchange::new();
        assert_eq!(kx.key_share().len(), KEY_SHARE_LEN);
        assert_eq!(kx.key_share()[0], 0x04);
    }

    #[test]
    fn sealed_frame_round_trips_both_ways() {
        let (a, b) = pair();
        let (mut a_seal, mut a_open) = a.split();
        let (mut b_seal, mut b_open) = b.split();

        let sealed = a_seal.seal(&control(7)).unwrap();
        assert_eq!(sealed.kind(), MessageType::Sealed);
        assert!(!sealed.payload().windows(40).any(|w| w == [7u8; 40]));
        assert_eq!(b_open.open(&sealed).unwrap(), control(7));

        let back = b_seal.seal(&control(9)).unwrap();
        assert_eq!(a_open.open(&back).unwrap(), control(9));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let (a, b) = pair();
        let (mut seal, _) = a.split();
        let (_, mut open) = b.split();

        let sealed = seal.seal(&control(1)).unwrap();
        let mut bytes = sealed.payload().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = Packet::new(MessageType::Sealed, bytes).unwrap();
        assert!(matches!(open.open(&tampered), Err(SkyError::Crypto(_))));
    }

    #[test]
    fn replayed_frame_is_rejected_but_gaps_are_not() {
        let (a, b) = pair();
        let (mut seal, _) = a.split();
        let (_, mut open) = b.split();

        let first = seal.seal(&control(1)).unwrap();
        let _dropped = seal.seal(&control(2)).unwrap();
        let third = seal.seal(&control(3)).unwrap();

        open.open(&first).unwrap();
        assert_eq!(open.open(&third).unwrap(), control(3));
        assert!(open.open(&first).is_err());
    }

    #[test]
    fn own_direction_cannot_be_opened() {
        let (a, _b) = pair();
        let (mut seal, mut open) = a.split();
        let sealed = seal.seal(&control(1)).unwrap();
        assert!(open.open(&sealed).is_err());
    }

    #[test]
    fn invalid_peer_share_is_rejected() {
        let kx = KeyExchange::new();
        assert!(matches!(
            kx.agree(Role::Initiator, &[0x04; KEY_SHARE_LEN]),
            Err(SkyError::Crypto(_))
        ));
    }

    #[test]
    fn different_exchanges_do_not_interoperate() {
        let (a, _) = pair();
        let (_, c) = pair();
        let (mut seal, _) = a.split();
        let (_, mut open) = c.split();
        assert!(open.open(&seal.seal(&control(1)).unwrap()).is_err());
    }
}
