//! Configuration for the host service.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use skylink_core::abr::AbrConfig;
use skylink_core::capture::{CaptureSettings, Resolution};
use skylink_core::encoder::{CodecProfile, EncoderSettings, EncodingConfiguration, QualityProfile};
use skylink_core::protocol::Capabilities;
use skylink_core::session::{AllowListAuthorizer, LocalIdentity, ServerConfig};
use skylink_core::transport::{LinkConfig, StunServer, TraversalConfig};
use skylink_core::SkyError;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub network: NetworkConfig,
    pub screen: ScreenConfig,
    pub encoding: EncodingSection,
    pub abr: AbrSection,
    pub traversal: TraversalSection,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the control listener on.
    pub bind: IpAddr,
    /// TCP port for viewer connections.
    pub control_port: u16,
    /// UDP port answering discovery probes.
    pub discovery_port: u16,
    /// Publish the service record on the LAN.
    pub advertise: bool,
    /// Name shown to viewers. Empty uses the machine's host name.
    pub device_name: String,
    /// Stable device id. Generated on every start when absent.
    pub device_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    /// Monitor index to capture (0 = primary).
    pub monitor_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingSection {
    /// "h264_baseline", "h264_main", "h264_high", "hevc_main", "auto", "raw_image".
    /// This build ships no hardware codec, so anything but "raw_image" is
    /// replaced with it.
    pub codec: CodecProfile,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u32,
    pub fps: u32,
    pub keyframe_interval: u32,
    /// "speed", "balanced" or "quality".
    pub quality: QualityProfile,
    /// Use the zstd raw-image codec when no hardware codec is available.
    pub software_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrSection {
    pub loss_threshold: f64,
    pub latency_ceiling_ms: u64,
    pub good_samples_to_increase: u32,
    pub min_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    pub min_fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalSection {
    /// `host` or `host:port`; port 3478 when omitted.
    pub stun_servers: Vec<String>,
    /// Relay used when no direct path works.
    pub relay: Option<SocketAddr>,
    pub connection_timeout_secs: u64,
    pub max_retry_count: u32,
    pub heartbeat_interval_secs: u64,
    pub max_missed_heartbeats: usize,
    /// Video frames allowed to queue before the oldest are dropped.
    pub send_queue_frames: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Accept any peer. Only for trusted networks.
    pub allow_any: bool,
    pub allowed_devices: Vec<Uuid>,
    /// Hex public-key fingerprints.
    pub allowed_fingerprints: Vec<String>,
    /// Refuse viewers that do not agree session keys.
    pub require_encryption: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            control_port: skylink_core::session::DEFAULT_CONTROL_PORT,
            discovery_port: skylink_core::session::DEFAULT_DISCOVERY_PORT,
            advertise: true,
            device_name: String::new(),
            device_id: None,
        }
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            monitor_index: 0,
            width: 1920,
            height: 1080,
            fps: 30,
        }
    }
}

impl Default for EncodingSection {
    fn default() -> Self {
        let enc = EncodingConfiguration::default();
        Self {
            codec: CodecProfile::RawImage,
            width: enc.resolution.width,
            height: enc.resolution.height,
            bitrate_bps: enc.bitrate_bps,
            fps: enc.frame_rate,
            keyframe_interval: enc.keyframe_interval,
            quality: enc.quality,
            software_fallback: true,
        }
    }
}

impl Default for AbrSection {
    fn default() -> Self {
        let abr = AbrConfig::default();
        Self {
            loss_threshold: abr.loss_threshold,
            latency_ceiling_ms: abr.latency_ceiling.as_millis() as u64,
            good_samples_to_increase: abr.good_samples_to_increase,
            min_bitrate_bps: abr.min_bitrate,
            max_bitrate_bps: abr.max_bitrate,
            min_fps: abr.min_frame_rate,
        }
    }
}

impl Default for TraversalSection {
    fn default() -> Self {
        let link = LinkConfig::default();
        let traversal = TraversalConfig::default();
        Self {
            stun_servers: StunServer::defaults().iter().map(|s| s.to_string()).collect(),
            relay: None,
            connection_timeout_secs: traversal.connection_timeout.as_secs(),
            max_retry_count: traversal.max_retry_count,
            heartbeat_interval_secs: link.heartbeat_interval.as_secs(),
            max_missed_heartbeats: link.max_missed_heartbeats,
            send_queue_frames: link.video_queue_bound,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allow_any: false,
            allowed_devices: Vec::new(),
            allowed_fingerprints: Vec::new(),
            require_encryption: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn device_name(&self) -> String {
        if !self.network.device_name.is_empty() {
            return self.network.device_name.clone();
        }
        ["COMPUTERNAME", "HOSTNAME"]
            .iter()
            .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| "skylink".into())
    }

    /// Build the server configuration, rejecting values the core would
    /// refuse later anyway.
    pub fn to_server_config(&self) -> Result<ServerConfig, SkyError> {
        let stun_servers = self
            .traversal
            .stun_servers
            .iter()
            .map(|s| s.parse::<StunServer>())
            .collect::<Result<Vec<_>, _>>()?;
        skylink_core::transport::nat::validate_servers(&stun_servers)?;

        let mut server = ServerConfig {
            bind_ip: self.network.bind,
            identity: LocalIdentity {
                device_id: self.network.device_id.unwrap_or_else(Uuid::new_v4),
                name: self.device_name(),
                ..LocalIdentity::default()
            },
            capabilities: Capabilities::SCREEN_CAPTURE
                | Capabilities::INPUT_INJECTION
                | Capabilities::RAW_IMAGE,
            require_encryption: self.security.require_encryption,
            stun_servers,
            ..ServerConfig::default()
        };

        server.traversal.connection_timeout = Duration::from_secs(self.traversal.connection_timeout_secs);
        server.traversal.max_retry_count = self.traversal.max_retry_count;

        let session = &mut server.session;
        session.link.heartbeat_interval = Duration::from_secs(self.traversal.heartbeat_interval_secs);
        session.link.max_missed_heartbeats = self.traversal.max_missed_heartbeats;
        session.link.video_queue_bound = self.traversal.send_queue_frames;

        let pipeline = &mut session.pipeline;
        pipeline.capture = CaptureSettings {
            resolution: Resolution::new(self.screen.width, self.screen.height),
            frame_rate: self.screen.fps,
            region: None,
        };
        if self.encoding.codec != CodecProfile::RawImage {
            tracing::warn!(
                requested = %self.encoding.codec,
                "no hardware encoder in this build; streaming raw_image"
            );
        }
        pipeline.encoding = EncodingConfiguration {
            codec: CodecProfile::RawImage,
            resolution: Resolution::new(self.encoding.width, self.encoding.height),
            bitrate_bps: self.encoding.bitrate_bps,
            frame_rate: self.encoding.fps,
            keyframe_interval: self.encoding.keyframe_interval,
            quality: self.encoding.quality,
            ..EncodingConfiguration::default()
        };
        pipeline.encoder = EncoderSettings {
            software_fallback: self.encoding.software_fallback,
            ..EncoderSettings::default()
        };
        pipeline.abr = AbrConfig {
            loss_threshold: self.abr.loss_threshold,
            latency_ceiling: Duration::from_millis(self.abr.latency_ceiling_ms),
            good_samples_to_increase: self.abr.good_samples_to_increase,
            min_bitrate: self.abr.min_bitrate_bps,
            max_bitrate: self.abr.max_bitrate_bps,
            min_frame_rate: self.abr.min_fps,
            ..AbrConfig::default()
        };

        pipeline.capture.validate()?;
        pipeline.encoding.validate(pipeline.capture.resolution)?;
        pipeline.abr.validate()?;
        Ok(server)
    }

    pub fn authorizer(&self) -> AllowListAuthorizer {
        if self.security.allow_any {
            return AllowListAuthorizer::allow_any();
        }
        let auth = self
            .security
            .allowed_devices
            .iter()
            .fold(AllowListAuthorizer::new(), |a, id| a.with_device(*id));
        self.security
            .allowed_fingerprints
            .iter()
            .fold(auth, |a, fp| a.with_fingerprint(fp.as_str()))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&HostConfig::default()).unwrap();
        assert!(text.contains("control_port = 5901"));
        assert!(text.contains("discovery_port = 5902"));
        assert!(text.contains("stun.l.google.com:19302"));
        assert!(text.contains("codec = \"raw_image\""));
        assert!(text.contains("require_encryption = true"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&HostConfig::default()).unwrap();
        let parsed: HostConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.control_port, 5901);
        assert_eq!(parsed.screen.fps, 30);
        assert_eq!(parsed.traversal.max_missed_heartbeats, 3);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: HostConfig = toml::from_str(
            "[encoding]\ncodec = \"hevc_main\"\n[security]\nallow_any = true\n",
        )
        .unwrap();
        assert_eq!(parsed.encoding.codec, CodecProfile::HevcMain);
        assert_eq!(parsed.encoding.width, 1280);
        assert!(parsed.security.allow_any);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn server_config_carries_sections() {
        let mut cfg = HostConfig::default();
        cfg.traversal.stun_servers = vec!["stun.example.org".into()];
        cfg.traversal.heartbeat_interval_secs = 2;
        cfg.encoding.codec = CodecProfile::Auto;
        let server = cfg.to_server_config().unwrap();
        assert_eq!(server.stun_servers, vec![StunServer::new("stun.example.org", 3478)]);
        assert_eq!(server.session.link.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(server.session.pipeline.encoding.codec, CodecProfile::RawImage);
        assert_eq!(
            server.capabilities,
            Capabilities::SCREEN_CAPTURE | Capabilities::INPUT_INJECTION | Capabilities::RAW_IMAGE
        );
        assert!(server.require_encryption);
        assert_eq!(server.session.pipeline.capture.resolution, Resolution::new(1920, 1080));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut cfg = HostConfig::default();
        cfg.traversal.stun_servers.clear();
        assert!(cfg.to_server_config().is_err());

        let mut cfg = HostConfig::default();
        cfg.encoding.width = 3840;
        cfg.encoding.height = 2160;
        assert!(cfg.to_server_config().is_err());

        let mut cfg = HostConfig::default();
        cfg.abr.good_samples_to_increase = 1;
        assert!(cfg.to_server_config().is_err());
    }
}
