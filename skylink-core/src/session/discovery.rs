//! Service advertisement.
//!
//! The host publishes a [`ServiceRecord`] through a [`ServiceAdvertiser`].
//! The bundled [`UdpAnnouncer`] answers LAN discovery probes:
//!
//! ```text
//! Viewer ──udp "SKYLINK?"──────────────────► Host :5902
//! Viewer ◄─udp {"platform":…,"remotePort":5901,…}── Host
//! ```
//!
//! Records can be updated after publishing, e.g. once a key fingerprint
//! is known.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SkyError;

pub const DEFAULT_DISCOVERY_PORT: u16 = 5902;

/// Datagram a viewer broadcasts to find hosts.
pub const DISCOVERY_PROBE: &[u8] = b"SKYLINK?";

// ── ServiceRecord ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub name: String,
    pub platform: String,
    pub os_version: String,
    pub model: String,
    pub capabilities: Vec<String>,
    pub remote_port: u16,
    pub device_id: Uuid,
    #[serde(rename = "pubKeyFP", default, skip_serializing_if = "Option::is_none")]
    pub pub_key_fp: Option<String>,
}

impl ServiceRecord {
    /// Text-record form: one key per field, capabilities comma-joined.
    pub fn to_txt(&self) -> BTreeMap<String, String> {
        let mut txt = BTreeMap::new();
        txt.insert("platform".into(), self.platform.clone());
        txt.insert("osVersion".into(), self.os_version.clone());
        txt.insert("name".into(), self.name.clone());
        txt.insert("model".into(), self.model.clone());
        txt.insert("capabilities".into(), self.capabilities.join(","));
        txt.insert("remotePort".into(), self.remote_port.to_string());
        txt.insert("deviceId".into(), self.device_id.to_string());
        if let Some(fp) = &self.pub_key_fp {
            txt.insert("pubKeyFP".into(), fp.clone());
        }
        txt
    }
}

// ── ServiceAdvertiser ────────────────────────────────────────────

#[async_trait]
pub trait ServiceAdvertiser: Send + Sync {
    async fn publish(&self, record: &ServiceRecord) -> Result<(), SkyError>;

    /// Replace the published record. No-op when nothing is published.
    async fn update(&self, record: &ServiceRecord) -> Result<(), SkyError>;

    async fn withdraw(&self) -> Result<(), SkyError>;
}

// ── UdpAnnouncer ─────────────────────────────────────────────────

struct Responder {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local: SocketAddr,
}

/// Answers [`DISCOVERY_PROBE`] datagrams with the current record as JSON.
pub struct UdpAnnouncer {
    bind: SocketAddr,
    record: Arc<Mutex<Option<ServiceRecord>>>,
    responder: tokio::sync::Mutex<Option<Responder>>,
}

impl UdpAnnouncer {
    pub fn new(port: u16) -> Self {
        Self::bind_to(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    pub fn bind_to(bind: SocketAddr) -> Self {
        Self {
            bind,
            record: Arc::new(Mutex::new(None)),
            responder: tokio::sync::Mutex::new(None),
        }
    }

    /// Bound address while published.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.responder.lock().await.as_ref().map(|r| r.local)
    }

    pub fn record(&self) -> Option<ServiceRecord> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, record: Option<ServiceRecord>) {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = record;
    }
}

#[async_trait]
impl ServiceAdvertiser for UdpAnnouncer {
    async fn publish(&self, record: &ServiceRecord) -> Result<(), SkyError> {
        self.store(Some(record.clone()));
        let mut responder = self.responder.lock().await;
        if responder.is_some() {
            return Ok(());
        }
        let socket = UdpSocket::bind(self.bind).await?;
        let local = socket.local_addr()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(respond_loop(
            socket,
            Arc::clone(&self.record),
            cancel.clone(),
        ));
        info!(%local, name = %record.name, "discovery responder listening");
        *responder = Some(Responder {
            cancel,
            task,
            local,
        });
        Ok(())
    }

    async fn update(&self, record: &ServiceRecord) -> Result<(), SkyError> {
        if self.responder.lock().await.is_some() {
            self.store(Some(record.clone()));
            debug!(fp = ?record.pub_key_fp, "advertisement updated");
        }
        Ok(())
    }

    async fn withdraw(&self) -> Result<(), SkyError> {
        self.store(None);
        if let Some(r) = self.responder.lock().await.take() {
            r.cancel.cancel();
            if let Err(e) = r.task.await {
                warn!(error = %e, "discovery responder ended abnormally");
            }
            info!("discovery responder stopped");
        }
        Ok(())
    }
}

async fn respond_loop(
    socket: UdpSocket,
    record: Arc<Mutex<Option<ServiceRecord>>>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 512];
    loop {
        let (len, src) = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => match r {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "discovery recv error");
                    continue;
                }
            },
        };
        if &buf[..len] != DISCOVERY_PROBE {
            debug!(%src, len, "ignoring unexpected discovery datagram");
            continue;
        }
        let current = record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(current) = current else {
            continue;
        };
        match serde_json::to_vec(&current) {
            Ok(reply) => {
                if let Err(e) = socket.send_to(&reply, src).await {
                    warn!(%src, error = %e, "failed to answer discovery probe");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode service record"),
        }
    }
}
