//! Signaling channel abstraction
//!
//! A peer talks to the SFU over an acknowledgeable, bidirectional channel.
//! The transport (WebSocket, in-memory, ...) is hidden behind
//! [`SignalingChannel`] for outbound traffic and an inbound request stream
//! bundled into a [`Connection`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::engine::{DtlsParameters, MediaKind, RtpParameters};
use crate::error::{Result, SfuError};
use crate::types::{PeerId, TrackId};

/// Events the server pushes to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEvent {
    Initialize,
    NewConsumer,
    PeerConnection,
    PeerDisconnection,
    NewTrackAvailable,
    ConsumerClosed,
    ConsumerPaused,
    ConsumerResumed,
    PeerMessage,
}

impl ServerEvent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::NewConsumer => "newConsumer",
            Self::PeerConnection => "peerConnection",
            Self::PeerDisconnection => "peerDisconnection",
            Self::NewTrackAvailable => "newTrackAvailable",
            Self::ConsumerClosed => "consumerClosed",
            Self::ConsumerPaused => "consumerPaused",
            Self::ConsumerResumed => "consumerResumed",
            Self::PeerMessage => "peerMessage",
        }
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound half of a signaling connection
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Fire-and-forget push
    fn send(&self, event: ServerEvent, payload: Value) -> Result<()>;

    /// Push and wait for exactly one acknowledgement from the client
    async fn request(&self, event: ServerEvent, payload: Value) -> Result<Value>;

    /// Close the underlying connection. The inbound request stream ends
    /// shortly afterwards.
    fn disconnect(&self);
}

type Responder = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

/// Acknowledgement slot of an inbound request.
///
/// Consumed on use. An `Ack` dropped without an answer responds with an
/// error so the client never waits forever.
pub struct Ack {
    responder: Option<Responder>,
}

impl Ack {
    pub fn new(responder: impl FnOnce(Result<Value>) + Send + 'static) -> Self {
        Self {
            responder: Some(Box::new(responder)),
        }
    }

    /// Ack for requests the client sent without asking for an answer
    #[must_use]
    pub fn noop() -> Self {
        Self { responder: None }
    }

    pub fn respond(mut self, result: Result<Value>) {
        if let Some(responder) = self.responder.take() {
            responder(result);
        }
    }

    pub fn ok(self, data: Value) {
        self.respond(Ok(data));
    }

    pub fn err(self, error: SfuError) {
        self.respond(Err(error));
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if let Some(responder) = self.responder.take() {
            responder(Err(SfuError::Signaling(
                "request dropped without a response".to_string(),
            )));
        }
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("pending", &self.responder.is_some())
            .finish()
    }
}

/// A request received from the client
#[derive(Debug)]
pub struct InboundRequest {
    pub event: String,
    pub data: Value,
    pub ack: Ack,
}

/// An accepted signaling connection: the outbound channel plus the stream of
/// inbound requests. The stream ending means the connection closed.
pub struct Connection {
    pub channel: Arc<dyn SignalingChannel>,
    pub requests: mpsc::UnboundedReceiver<InboundRequest>,
}

impl Connection {
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        requests: mpsc::UnboundedReceiver<InboundRequest>,
    ) -> Self {
        Self { channel, requests }
    }
}

/// Requests a client may send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    CreateRecvTransport {},
    CreateSendTransport {},
    ConnectRecvTransport {
        dtls_parameters: DtlsParameters,
    },
    ConnectSendTransport {
        dtls_parameters: DtlsParameters,
    },
    NewProducer {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: Value,
    },
    ProducerClosed {
        id: TrackId,
    },
    PauseProducer {
        id: TrackId,
    },
    ResumeProducer {
        id: TrackId,
    },
    CreateConsumer {
        id: PeerId,
        track_id: TrackId,
        #[serde(default)]
        paused: bool,
    },
    PauseConsumer {
        track_id: TrackId,
    },
    ResumeConsumer {
        track_id: TrackId,
    },
    CloseConsumer {
        track_id: TrackId,
    },
    Message(Value),
}

impl ClientRequest {
    /// Decode an inbound event. Missing payloads are treated as `{}`, except
    /// for `message` whose payload is passed through untouched.
    pub fn parse(event: &str, data: Value) -> Result<Self> {
        if event == "message" {
            return Ok(Self::Message(data));
        }
        let data = if data.is_null() { json!({}) } else { data };
        serde_json::from_value(json!({ "event": event, "data": data }))
            .map_err(|e| SfuError::InvalidRequest(format!("{event}: {e}")))
    }
}
