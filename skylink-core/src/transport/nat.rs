//! NAT classification.
//!
//! The classifier only sees mapped addresses returned by a [`StunProber`],
//! so the same scripted responses always produce the same [`NatType`].
//!
//! ```text
//! A ×N ──none──► Unknown
//!   │ mapping changes ──► Symmetric
//!   │ mapped == local ──► NoNat
//! B ──differs from A──► Symmetric
//! A + change(ip,port) answered ──► FullCone
//! A + change(port)    answered ──► RestrictedCone
//!                     otherwise ──► PortRestrictedCone
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SkyError;
use crate::transport::stun::StunServer;

// ── NatType ──────────────────────────────────────────────────────

/// Ordered by traversal ease; `Unknown` sorts last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NatType {
    NoNat,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    Unknown,
}

impl NatType {
    pub fn difficulty(self) -> TraversalDifficulty {
        match self {
            NatType::NoNat | NatType::FullCone => TraversalDifficulty::Easy,
            NatType::RestrictedCone | NatType::PortRestrictedCone => TraversalDifficulty::Medium,
            NatType::Symmetric => TraversalDifficulty::Hard,
            NatType::Unknown => TraversalDifficulty::Unknown,
        }
    }

    /// Whether a direct connection is worth attempting.
    pub fn allows_direct(self) -> bool {
        !matches!(self, NatType::Symmetric | NatType::Unknown)
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatType::NoNat => "noNAT",
            NatType::FullCone => "fullCone",
            NatType::RestrictedCone => "restrictedCone",
            NatType::PortRestrictedCone => "portRestrictedCone",
            NatType::Symmetric => "symmetric",
            NatType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraversalDifficulty {
    Easy,
    Medium,
    Hard,
    Unknown,
}

/// Heuristic connection success rate per difficulty. A priority signal
/// only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuccessRateTable {
    pub easy: f64,
    pub medium: f64,
    pub hard: f64,
    pub unknown: f64,
}

impl Default for SuccessRateTable {
    fn default() -> Self {
        Self {
            easy: 0.95,
            medium: 0.75,
            hard: 0.35,
            unknown: 0.10,
        }
    }
}

impl SuccessRateTable {
    pub fn rate(&self, difficulty: TraversalDifficulty) -> f64 {
        match difficulty {
            TraversalDifficulty::Easy => self.easy,
            TraversalDifficulty::Medium => self.medium,
            TraversalDifficulty::Hard => self.hard,
            TraversalDifficulty::Unknown => self.unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NatDetectionResult {
    pub nat_type: NatType,
    pub public_addr: Option<SocketAddr>,
    pub difficulty: TraversalDifficulty,
    pub success_rate: f64,
    pub latency: Duration,
}

// ── StunProber ───────────────────────────────────────────────────

/// One binding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub server: StunServer,
    pub change_ip: bool,
    pub change_port: bool,
}

impl ProbeRequest {
    pub fn plain(server: &StunServer) -> Self {
        Self {
            server: server.clone(),
            change_ip: false,
            change_port: false,
        }
    }
}

/// Sends binding requests. `None` means no usable response.
#[async_trait]
pub trait StunProber: Send + Sync {
    /// Local address the probes are sent from.
    fn local_addr(&self) -> Option<SocketAddr>;

    async fn probe(&self, request: ProbeRequest) -> Option<SocketAddr>;
}

// ── NatClassifier ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NatDetectionConfig {
    pub probe_timeout: Duration,
    pub detection_timeout: Duration,
    /// Binding requests sent to the first server.
    pub probe_repeats: u32,
}

impl Default for NatDetectionConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(3),
            detection_timeout: Duration::from_secs(10),
            probe_repeats: 2,
        }
    }
}

pub struct NatClassifier {
    servers: Vec<StunServer>,
    config: NatDetectionConfig,
    rates: SuccessRateTable,
}

impl NatClassifier {
    pub fn new(servers: Vec<StunServer>, config: NatDetectionConfig) -> Self {
        Self {
            servers,
            config,
            rates: SuccessRateTable::default(),
        }
    }

    pub fn with_rates(mut self, rates: SuccessRateTable) -> Self {
        self.rates = rates;
        self
    }

    /// Classify the NAT in front of `prober`. Never fails: probes that do
    /// not complete in time yield [`NatType::Unknown`].
    pub async fn detect(&self, prober: &dyn StunProber) -> NatDetectionResult {
        let started = Instant::now();
        let (nat_type, public_addr) =
            match tokio::time::timeout(self.config.detection_timeout, self.classify(prober)).await {
                Ok(found) => found,
                Err(_) => {
                    warn!(timeout = ?self.config.detection_timeout, "NAT detection timed out");
                    (NatType::Unknown, None)
                }
            };

        let difficulty = nat_type.difficulty();
        let result = NatDetectionResult {
            nat_type,
            public_addr,
            difficulty,
            success_rate: self.rates.rate(difficulty),
            latency: started.elapsed(),
        };
        info!(
            nat = %result.nat_type,
            public = ?result.public_addr,
            latency_ms = result.latency.as_millis() as u64,
            "NAT classified"
        );
        result
    }

    async fn probe(&self, prober: &dyn StunProber, request: ProbeRequest) -> Option<SocketAddr> {
        let server = request.server.clone();
        match tokio::time::timeout(self.config.probe_timeout, prober.probe(request)).await {
            Ok(mapped) => mapped,
            Err(_) => {
                debug!(%server, "STUN probe timed out");
                None
            }
        }
    }

    async fn classify(&self, prober: &dyn StunProber) -> (NatType, Option<SocketAddr>) {
        let Some(primary) = self.servers.first() else {
            warn!("no STUN servers configured");
            return (NatType::Unknown, None);
        };

        // 1. Repeated binding to the primary server.
        let Some(mapped) = self.probe(prober, ProbeRequest::plain(primary)).await else {
            return (NatType::Unknown, None);
        };
        for _ in 1..self.config.probe_repeats {
            if let Some(again) = self.probe(prober, ProbeRequest::plain(primary)).await {
                if again != mapped {
                    return (NatType::Symmetric, Some(mapped));
                }
            }
        }

        // 2. No translation at all.
        if prober.local_addr() == Some(mapped) {
            return (NatType::NoNat, Some(mapped));
        }

        // 3. Mapping must not depend on the destination.
        if let Some(secondary) = self.servers.get(1) {
            if let Some(other) = self.probe(prober, ProbeRequest::plain(secondary)).await {
                if other != mapped {
                    return (NatType::Symmetric, Some(mapped));
                }
            }
        }

        // 4/5. Filtering behaviour.
        let change_both = ProbeRequest {
            server: primary.clone(),
            change_ip: true,
            change_port: true,
        };
        if self.probe(prober, change_both).await.is_some() {
            return (NatType::FullCone, Some(mapped));
        }
        let change_port = ProbeRequest {
            server: primary.clone(),
            change_ip: false,
            change_port: true,
        };
        if self.probe(prober, change_port).await.is_some() {
            (NatType::RestrictedCone, Some(mapped))
        } else {
            (NatType::PortRestrictedCone, Some(mapped))
        }
    }
}

// ── NatCache ─────────────────────────────────────────────────────

/// Last detection result, kept until a connectivity change.
#[derive(Default)]
pub struct NatCache {
    cached: Mutex<Option<NatDetectionResult>>,
}

impl NatCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached result, or run detection. Concurrent callers wait for one
    /// detection.
    pub async fn get_or_detect(
        &self,
        classifier: &NatClassifier,
        prober: &dyn StunProber,
    ) -> NatDetectionResult {
        let mut slot = self.cached.lock().await;
        if let Some(hit) = slot.as_ref() {
            return hit.clone();
        }
        let result = classifier.detect(prober).await;
        *slot = Some(result.clone());
        result
    }

    pub async fn get(&self) -> Option<NatDetectionResult> {
        self.cached.lock().await.clone()
    }

    pub async fn invalidate(&self) {
        if self.cached.lock().await.take().is_some() {
            info!("NAT cache invalidated");
        }
    }
}

/// Rejects an empty server list early.
pub fn validate_servers(servers: &[StunServer]) -> Result<(), SkyError> {
    if servers.is_empty() {
        return Err(SkyError::InvalidConfig("at least one STUN server is required".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers from a fixed table keyed by (host, change_ip, change_port).
    struct Scripted {
        local: SocketAddr,
        answers: HashMap<(String, bool, bool), Vec<SocketAddr>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(local: &str) -> Self {
            Self {
                local: local.parse().unwrap(),
                answers: HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn answer(mut self, host: &str, ip: bool, port: bool, addrs: &[&str]) -> Self {
            self.answers.insert(
                (host.to_string(), ip, port),
                addrs.iter().map(|a| a.parse().unwrap()).collect(),
            );
            self
        }
    }

    #[async_trait]
    impl StunProber for Scripted {
        fn local_addr(&self) -> Option<SocketAddr> {
            Some(self.local)
        }

        async fn probe(&self, req: ProbeRequest) -> Option<SocketAddr> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let list = self
                .answers
                .get(&(req.server.host.clone(), req.change_ip, req.change_port))?;
            list.get(n % list.len()).copied()
        }
    }

    fn classifier() -> NatClassifier {
        NatClassifier::new(
            vec![StunServer::new("a", 3478), StunServer::new("b", 3478)],
            NatDetectionConfig {
                probe_timeout: Duration::from_millis(100),
                detection_timeout: Duration::from_secs(1),
                probe_repeats: 1,
            },
        )
    }

    #[tokio::test]
    async fn no_response_is_unknown() {
        let prober = Scripted::new("10.0.0.2:4000");
        let result = classifier().detect(&prober).await;
        assert_eq!(result.nat_type, NatType::Unknown);
        assert_eq!(result.difficulty, TraversalDifficulty::Unknown);
        assert_eq!(result.success_rate, 0.10);
    }

    #[tokio::test]
    async fn mapped_equals_local_is_no_nat() {
        let prober = Scripted::new("198.51.100.7:4000").answer("a", false, false, &["198.51.100.7:4000"]);
        assert_eq!(classifier().detect(&prober).await.nat_type, NatType::NoNat);
    }

    #[tokio::test]
    async fn cone_variants() {
        let full = Scripted::new("10.0.0.2:4000")
            .answer("a", false, false, &["203.0.113.1:5000"])
            .answer("b", false, false, &["203.0.113.1:5000"])
            .answer("a", true, true, &["203.0.113.1:5000"]);
        assert_eq!(classifier().detect(&full).await.nat_type, NatType::FullCone);

        let restricted = Scripted::new("10.0.0.2:4000")
            .answer("a", false, false, &["203.0.113.1:5000"])
            .answer("a", false, true, &["203.0.113.1:5000"]);
        let r = classifier().detect(&restricted).await;
        assert_eq!(r.nat_type, NatType::RestrictedCone);
        assert_eq!(r.difficulty, TraversalDifficulty::Medium);

        let port_restricted =
            Scripted::new("10.0.0.2:4000").answer("a", false, false, &["203.0.113.1:5000"]);
        assert_eq!(
            classifier().detect(&port_restricted).await.nat_type,
            NatType::PortRestrictedCone
        );
    }

    #[tokio::test]
    async fn differing_mapping_per_server_is_symmetric() {
        let prober = Scripted::new("10.0.0.2:4000")
            .answer("a", false, false, &["203.0.113.1:5000"])
            .answer("b", false, false, &["203.0.113.1:5001"]);
        let result = classifier().detect(&prober).await;
        assert_eq!(result.nat_type, NatType::Symmetric);
        assert_eq!(result.difficulty, TraversalDifficulty::Hard);
        assert_eq!(result.public_addr, Some("203.0.113.1:5000".parse().unwrap()));
    }

    #[tokio::test]
    async fn classification_is_deterministic() {
        let make = || {
            Scripted::new("10.0.0.2:4000")
                .answer("a", false, false, &["203.0.113.1:5000"])
                .answer("a", false, true, &["203.0.113.1:5000"])
        };
        let first = classifier().detect(&make()).await.nat_type;
        for _ in 0..5 {
            assert_eq!(classifier().detect(&make()).await.nat_type, first);
        }
    }

    #[tokio::test]
    async fn cache_detects_once_until_invalidated() {
        let prober = Scripted::new("198.51.100.7:4000").answer("a", false, false, &["198.51.100.7:4000"]);
        let cache = NatCache::new();
        let c = classifier();

        cache.get_or_detect(&c, &prober).await;
        let after_first = prober.calls.load(Ordering::SeqCst);
        cache.get_or_detect(&c, &prober).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), after_first);

        cache.invalidate().await;
        assert!(cache.get().await.is_none());
        cache.get_or_detect(&c, &prober).await;
        assert!(prober.calls.load(Ordering::SeqCst) > after_first);
    }

    #[test]
    fn ordering_by_traversal_ease() {
        assert!(NatType::NoNat < NatType::FullCone);
        assert!(NatType::PortRestrictedCone < NatType::Symmetric);
        assert!(!NatType::Symmetric.allows_direct());
        assert!(NatType::RestrictedCone.allows_direct());
    }

    #[test]
    fn empty_server_list_rejected() {
        assert!(validate_servers(&[]).is_err());
    }
}
