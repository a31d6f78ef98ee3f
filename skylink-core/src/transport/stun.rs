//! Minimal STUN binding client (RFC 5389).
//!
//! Only what NAT classification needs: a binding request, optionally with
//! a CHANGE-REQUEST attribute, and the mapped address out of a success
//! response.
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────┬────────────────────┐
//! │ type: u16    │ length: u16  │ cookie: u32      │ transaction: [u8;12]│
//! └──────────────┴──────────────┴──────────────────┴────────────────────┘
//!   attributes: [type u16][length u16][value, padded to 4]...
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::SkyError;
use crate::transport::nat::{ProbeRequest, StunProber};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const DEFAULT_STUN_PORT: u16 = 3478;

const HEADER_LEN: usize = 20;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const CHANGE_IP: u32 = 0x04;
const CHANGE_PORT: u32 = 0x02;

/// Resend interval while waiting for a binding response.
const RETRANSMIT: Duration = Duration::from_millis(500);

// ── StunServer ───────────────────────────────────────────────────

/// A STUN server endpoint, `host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StunServer {
    pub host: String,
    pub port: u16,
}

impl StunServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn defaults() -> Vec<StunServer> {
        vec![
            StunServer::new("stun.l.google.com", 19302),
            StunServer::new("stun1.l.google.com", 19302),
        ]
    }

    /// First IPv4 address the host resolves to.
    pub async fn resolve(&self) -> Result<SocketAddr, SkyError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        addrs.find(SocketAddr::is_ipv4).ok_or_else(|| {
            SkyError::Other(format!("STUN server {self} has no IPv4 address"))
        })
    }
}

impl FromStr for StunServer {
    type Err = SkyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SkyError::InvalidConfig("empty STUN server".into()));
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| SkyError::InvalidConfig(format!("bad STUN port in {s:?}")))?;
                Ok(StunServer::new(host, port))
            }
            None => Ok(StunServer::new(s, DEFAULT_STUN_PORT)),
        }
    }
}

impl fmt::Display for StunServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ── Binding request / response ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingRequest {
    pub transaction_id: [u8; 12],
    pub change_ip: bool,
    pub change_port: bool,
}

impl BindingRequest {
    pub fn new(change_ip: bool, change_port: bool) -> Self {
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..12]);
        Self {
            transaction_id,
            change_ip,
            change_port,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let with_change = self.change_ip || self.change_port;
        let attr_len: u16 = if with_change { 8 } else { 0 };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + attr_len as usize);
        buf.put_u16(BINDING_REQUEST);
        buf.put_u16(attr_len);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);

        if with_change {
            let mut flags = 0;
            if self.change_ip {
                flags |= CHANGE_IP;
            }
            if self.change_port {
                flags |= CHANGE_PORT;
            }
            buf.put_u16(ATTR_CHANGE_REQUEST);
            buf.put_u16(4);
            buf.put_u32(flags);
        }
        buf
    }
}

/// Extract the mapped address from a binding success response.
///
/// `Ok(None)` means the datagram belongs to another transaction.
/// XOR-MAPPED-ADDRESS is preferred over MAPPED-ADDRESS.
pub fn parse_binding_response(
    datagram: &[u8],
    transaction_id: &[u8; 12],
) -> Result<Option<SocketAddr>, SkyError> {
    if datagram.len() < HEADER_LEN {
        return Err(SkyError::ProtocolViolation("short STUN message".into()));
    }
    let mut buf = datagram;
    let msg_type = buf.get_u16();
    let msg_len = buf.get_u16() as usize;
    let cookie = buf.get_u32();
    if cookie != MAGIC_COOKIE {
        return Err(SkyError::ProtocolViolation("bad STUN magic cookie".into()));
    }
    if &buf[..12] != transaction_id {
        return Ok(None);
    }
    buf.advance(12);
    if msg_type != BINDING_SUCCESS {
        return Err(SkyError::ProtocolViolation(format!(
            "unexpected STUN message type {msg_type:#06x}"
        )));
    }
    if buf.len() < msg_len {
        return Err(SkyError::ProtocolViolation("truncated STUN attributes".into()));
    }
    let mut attrs = &buf[..msg_len];

    let mut mapped = None;
    while attrs.len() >= 4 {
        let attr_type = attrs.get_u16();
        let attr_len = attrs.get_u16() as usize;
        let padded = (attr_len + 3) & !3;
        if attrs.len() < attr_len {
            return Err(SkyError::ProtocolViolation("truncated STUN attribute".into()));
        }
        let value = &attrs[..attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                return decode_address(value, Some(transaction_id)).map(Some);
            }
            ATTR_MAPPED_ADDRESS => mapped = Some(decode_address(value, None)?),
            _ => {}
        }
        attrs.advance(padded.min(attrs.len()));
    }

    match mapped {
        Some(addr) => Ok(Some(addr)),
        None => Err(SkyError::ProtocolViolation(
            "binding response without mapped address".into(),
        )),
    }
}

fn decode_address(mut value: &[u8], xor: Option<&[u8; 12]>) -> Result<SocketAddr, SkyError> {
    if value.len() < 8 {
        return Err(SkyError::ProtocolViolation("short address attribute".into()));
    }
    value.advance(1);
    let family = value.get_u8();
    let mut port = value.get_u16();
    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        0x01 => {
            let mut raw = value.get_u32();
            if xor.is_some() {
                raw ^= MAGIC_COOKIE;
            }
            IpAddr::V4(Ipv4Addr::from(raw))
        }
        0x02 => {
            if value.len() < 16 {
                return Err(SkyError::ProtocolViolation("short IPv6 address".into()));
            }
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&value[..16]);
            if let Some(tid) = xor {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                key[4..].copy_from_slice(tid);
                for (b, k) in raw.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(raw))
        }
        other => {
            return Err(SkyError::UnknownVariant {
                type_name: "StunAddressFamily",
                value: other as u64,
            });
        }
    };
    Ok(SocketAddr::new(ip, port))
}

// ── UdpStunProber ────────────────────────────────────────────────

/// [`StunProber`] over a single UDP socket, so every probe shares one
/// local mapping.
pub struct UdpStunProber {
    socket: UdpSocket,
    local: SocketAddr,
}

impl UdpStunProber {
    /// Bind an ephemeral socket. `route_hint` is used once to learn which
    /// local interface address outbound traffic leaves from.
    pub async fn bind(route_hint: &StunServer) -> Result<Self, SkyError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let port = socket.local_addr()?.port();

        let local_ip = match route_hint.resolve().await {
            Ok(target) => {
                let probe = UdpSocket::bind("0.0.0.0:0").await?;
                probe.connect(target).await?;
                probe.local_addr()?.ip()
            }
            Err(e) => {
                warn!(server = %route_hint, error = %e, "cannot resolve STUN server for route lookup");
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            }
        };

        Ok(Self {
            socket,
            local: SocketAddr::new(local_ip, port),
        })
    }

    async fn exchange(&self, request: &ProbeRequest) -> Result<SocketAddr, SkyError> {
        let target = request.server.resolve().await?;
        let binding = BindingRequest::new(request.change_ip, request.change_port);
        let wire = binding.encode();
        let mut buf = [0u8; 512];

        loop {
            self.socket.send_to(&wire, target).await?;
            // Responses to CHANGE-REQUEST come from another address, so
            // match on the transaction id rather than the source.
            let Ok(recv) = tokio::time::timeout(RETRANSMIT, self.socket.recv_from(&mut buf)).await
            else {
                continue;
            };
            let (len, from) = recv?;
            match parse_binding_response(&buf[..len], &binding.transaction_id) {
                Ok(Some(addr)) => return Ok(addr),
                Ok(None) => debug!(%from, "stale STUN response ignored"),
                Err(e) => debug!(%from, error = %e, "malformed STUN response ignored"),
            }
        }
    }
}

#[async_trait]
impl StunProber for UdpStunProber {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    async fn probe(&self, request: ProbeRequest) -> Option<SocketAddr> {
        match self.exchange(&request).await {
            Ok(addr) => Some(addr),
            Err(e) => {
                debug!(server = %request.server, error = %e, "STUN probe failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_response(tid: &[u8; 12], attr_type: u16, value: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(BINDING_SUCCESS);
        buf.put_u16(4 + value.len() as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(tid);
        buf.put_u16(attr_type);
        buf.put_u16(value.len() as u16);
        buf.put_slice(value);
        buf.to_vec()
    }

    #[test]
    fn request_layout() {
        let req = BindingRequest::new(false, false);
        let wire = req.encode();
        assert_eq!(wire.len(), 20);
        assert_eq!(&wire[..2], &[0x00, 0x01]);
        assert_eq!(&wire[4..8], &MAGIC_COOKIE.to_be_bytes());

        let change = BindingRequest::new(true, true).encode();
        assert_eq!(change.len(), 28);
        assert_eq!(&change[20..22], &[0x00, 0x03]);
        assert_eq!(change[27], 0x06);
    }

    #[test]
    fn xor_mapped_ipv4() {
        let tid = [7u8; 12];
        let addr: SocketAddr = "203.0.113.5:54321".parse().unwrap();
        let IpAddr::V4(v4) = addr.ip() else { unreachable!() };

        let mut value = vec![0, 0x01];
        value.extend_from_slice(&(addr.port() ^ 0x2112).to_be_bytes());
        value.extend_from_slice(&(u32::from(v4) ^ MAGIC_COOKIE).to_be_bytes());

        let resp = success_response(&tid, ATTR_XOR_MAPPED_ADDRESS, &value);
        assert_eq!(parse_binding_response(&resp, &tid).unwrap(), Some(addr));
    }

    #[test]
    fn plain_mapped_address() {
        let tid = [1u8; 12];
        let value = [0, 0x01, 0x1F, 0x90, 192, 0, 2, 1];
        let resp = success_response(&tid, ATTR_MAPPED_ADDRESS, &value);
        assert_eq!(
            parse_binding_response(&resp, &tid).unwrap(),
            Some("192.0.2.1:8080".parse().unwrap())
        );
    }

    #[test]
    fn other_transaction_is_ignored() {
        let value = [0, 0x01, 0x1F, 0x90, 192, 0, 2, 1];
        let resp = success_response(&[1u8; 12], ATTR_MAPPED_ADDRESS, &value);
        assert_eq!(parse_binding_response(&resp, &[2u8; 12]).unwrap(), None);
    }

    #[test]
    fn server_parsing() {
        let s: StunServer = "stun.example.org".parse().unwrap();
        assert_eq!(s.port, DEFAULT_STUN_PORT);
        let s: StunServer = "stun.example.org:19302".parse().unwrap();
        assert_eq!(s, StunServer::new("stun.example.org", 19302));
        assert!("host:notaport".parse::<StunServer>().is_err());
    }
}
