//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{ListenIp, MediaKind, RouterOptions, RtpCodecCapability, WebRtcTransportOptions};

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// How long an empty room survives before it is closed
    pub idle_timeout_ms: u64,
    /// Disconnect peers that do not answer `initialize` in time (None = wait forever)
    pub handshake_timeout_ms: Option<u64>,
    /// Events buffered for a peer that has not finished its handshake
    pub pending_event_capacity: usize,
    pub router: RouterConfig,
    pub webrtc_transport: WebRtcTransportConfig,
    pub inspector: InspectorConfig,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            max_peers_per_room: 0,
            idle_timeout_ms: 60_000,
            handshake_timeout_ms: None,
            pending_event_capacity: 1024,
            router: RouterConfig::default(),
            webrtc_transport: WebRtcTransportConfig::default(),
            inspector: InspectorConfig::default(),
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    /// Check the configuration, collecting every problem instead of stopping
    /// at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.idle_timeout_ms == 0 {
            errors.push("idle_timeout_ms must be greater than 0".to_string());
        }
        if self.handshake_timeout_ms == Some(0) {
            errors.push("handshake_timeout_ms must be greater than 0 when set".to_string());
        }
        if self.pending_event_capacity == 0 {
            errors.push("pending_event_capacity must be greater than 0".to_string());
        }
        if self.router.media_codecs.is_empty() {
            errors.push("router.media_codecs must not be empty".to_string());
        }
        if self.webrtc_transport.listen_ips.is_empty() {
            errors.push("webrtc_transport.listen_ips must not be empty".to_string());
        }
        if !self.webrtc_transport.enable_udp && !self.webrtc_transport.enable_tcp {
            errors.push("webrtc_transport must enable at least one of udp or tcp".to_string());
        }

        let inspector = &self.inspector;
        if inspector.enabled {
            if inspector.command.as_os_str().is_empty() {
                errors.push("inspector.command must not be empty".to_string());
            }
            if inspector.min_port == 0 || inspector.min_port > inspector.max_port {
                errors.push(format!(
                    "inspector port range {}-{} is invalid",
                    inspector.min_port, inspector.max_port
                ));
            }
            if !self
                .router
                .media_codecs
                .iter()
                .any(|c| c.mime_type.eq_ignore_ascii_case(&inspector.codec_mime_type))
            {
                errors.push(format!(
                    "inspector codec {} is not in router.media_codecs",
                    inspector.codec_mime_type
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Codecs every room router is created with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: vec![
                RtpCodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48_000,
                    channels: Some(2),
                    preferred_payload_type: Some(100),
                    parameters: serde_json::Map::new(),
                },
                RtpCodecCapability {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90_000,
                    channels: None,
                    preferred_payload_type: Some(101),
                    parameters: serde_json::Map::new(),
                },
            ],
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            media_codecs: self.media_codecs.clone(),
        }
    }

    /// Payload type the router assigns to the codec with this MIME type
    #[must_use]
    pub fn payload_type(&self, mime_type: &str) -> Option<u8> {
        self.media_codecs
            .iter()
            .find(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
            .and_then(|c| c.preferred_payload_type)
    }
}

/// Options for the browser-facing transports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcTransportConfig {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub enable_sctp: bool,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp {
                ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                announced_ip: None,
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            enable_sctp: false,
        }
    }
}

impl WebRtcTransportConfig {
    #[must_use]
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: self.listen_ips.clone(),
            enable_udp: self.enable_udp,
            enable_tcp: self.enable_tcp,
            prefer_udp: self.prefer_udp,
            enable_sctp: self.enable_sctp,
        }
    }
}

/// Diagnostic subprocess settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    /// Spawn an inspector for every room
    pub enabled: bool,
    /// Path of the inspector binary
    pub command: PathBuf,
    /// Lowest UDP port probed for the plain transport target
    pub min_port: u16,
    /// Highest UDP port probed (inclusive)
    pub max_port: u16,
    /// Directory the inspector writes its logs to
    pub output_path: PathBuf,
    /// Grace period between SIGINT and SIGKILL
    pub kill_timeout_ms: u64,
    /// Local address of the plain transport
    pub listen_ip: IpAddr,
    /// Address the plain transport sends RTP to
    pub connect_ip: IpAddr,
    /// The only codec forwarded to the inspector
    pub codec_mime_type: String,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: PathBuf::from("../inspector/out/inspector"),
            min_port: 30_000,
            max_port: 35_000,
            output_path: PathBuf::from("../../inspector-logs/"),
            kill_timeout_ms: 30_000,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            codec_mime_type: "video/VP8".to_string(),
        }
    }
}

impl InspectorConfig {
    #[must_use]
    pub const fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = SfuConfig::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(60));
        assert!(config.handshake_timeout().is_none());
        assert_eq!(config.router.payload_type("audio/opus"), Some(100));
        assert_eq!(config.router.payload_type("video/vp8"), Some(101));
        assert_eq!(config.inspector.kill_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = SfuConfig::default();
        config.idle_timeout_ms = 0;
        config.pending_event_capacity = 0;
        config.inspector.enabled = true;
        config.inspector.min_port = 40_000;
        config.inspector.codec_mime_type = "video/H264".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("idle_timeout_ms")));
        assert!(errors.iter().any(|e| e.contains("port range")));
        assert!(errors.iter().any(|e| e.contains("video/H264")));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SfuConfig = serde_json::from_value(json!({
            "max_rooms": 5,
            "inspector": { "enabled": true, "min_port": 31000 }
        }))
        .unwrap();

        assert_eq!(config.max_rooms, 5);
        assert_eq!(config.idle_timeout_ms, 60_000);
        assert!(config.inspector.enabled);
        assert_eq!(config.inspector.min_port, 31_000);
        assert_eq!(config.inspector.max_port, 35_000);
    }
}
