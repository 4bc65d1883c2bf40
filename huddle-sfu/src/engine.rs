//! Media engine capability interface
//!
//! The SFU never touches RTP itself. Workers, routers, transports, producers
//! and consumers live inside an external media engine; this module describes
//! the handful of capabilities the orchestration layer needs from them.
//!
//! Engine handles report lifecycle changes through callbacks registered once
//! at creation time (`on_close`, `on_pause`, `on_resume`). Callbacks may be
//! invoked synchronously from inside `close()`/`pause()`/`resume()`, so callers
//! must never hold a lock while calling into a handle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::Result;

/// RTP capabilities as exchanged with clients. Opaque to the SFU.
pub type RtpCapabilities = Value;
/// RTP parameters of a producer or consumer. Opaque to the SFU.
pub type RtpParameters = Value;
/// DTLS parameters supplied by a client when connecting a transport.
pub type DtlsParameters = Value;

/// Callback fired once when a handle closes
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;
/// Callback fired on every pause or resume
pub type StateCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// A codec the router is able to route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, Value>,
}

/// Local address a transport listens on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenIp {
    pub ip: IpAddr,
    /// Address advertised to clients when `ip` is not publicly reachable
    #[serde(default)]
    pub announced_ip: Option<String>,
}

/// Resource usage of a worker process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerResourceUsage {
    /// Cumulative user CPU time in milliseconds
    pub ru_utime: u64,
    /// Cumulative system CPU time in milliseconds
    pub ru_stime: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    pub media_codecs: Vec<RtpCodecCapability>,
}

#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub enable_sctp: bool,
}

#[derive(Debug, Clone)]
pub struct PlainTransportOptions {
    pub listen_ip: ListenIp,
    /// Learn the remote address from the first packet instead of `connect`
    pub comedia: bool,
    pub rtcp_mux: bool,
}

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    pub app_data: Value,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
    pub app_data: Value,
}

/// Connection parameters of a WebRTC transport, returned to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    pub sctp_parameters: Option<Value>,
}

/// A media engine worker (one OS process in the engine)
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> &str;

    async fn resource_usage(&self) -> Result<WorkerResourceUsage>;

    async fn create_router(&self, options: &RouterOptions) -> Result<Arc<dyn MediaRouter>>;
}

/// Per-room media routing context
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> &str;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>>;

    async fn create_plain_transport(
        &self,
        options: &PlainTransportOptions,
    ) -> Result<Arc<dyn PlainTransport>>;

    /// Closes the router and every transport created on it
    fn close(&self);
}

/// Capabilities shared by every transport kind
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;

    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>>;

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>>;

    fn close(&self);

    fn on_close(&self, callback: CloseCallback);
}

/// DTLS/ICE transport towards a browser
#[async_trait]
pub trait WebRtcTransport: Transport {
    fn parameters(&self) -> TransportParameters;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;
}

/// Unencrypted RTP transport towards a fixed address
#[async_trait]
pub trait PlainTransport: Transport {
    async fn connect(&self, ip: IpAddr, port: u16) -> Result<()>;
}

/// An inbound track
#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn app_data(&self) -> Value;

    fn paused(&self) -> bool;

    fn closed(&self) -> bool;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Idempotent; fires the close callbacks on the first call only
    fn close(&self);

    fn on_close(&self, callback: CloseCallback);

    fn on_pause(&self, callback: StateCallback);

    fn on_resume(&self, callback: StateCallback);
}

/// An outbound copy of a producer for one endpoint
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    /// Engine consumer type, e.g. `simple` or `simulcast`
    fn consumer_type(&self) -> &str;

    fn app_data(&self) -> Value;

    fn paused(&self) -> bool;

    fn closed(&self) -> bool;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Idempotent; fires the close callbacks on the first call only
    fn close(&self);

    fn on_close(&self, callback: CloseCallback);
}
