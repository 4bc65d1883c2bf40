//! SFU Peer management
//!
//! One `SfuPeer` per signaling connection. A peer starts `Pending`, becomes
//! `Ready` once the client answers `initialize`, and ends `Closed` when the
//! connection goes away. Broadcasts addressed to a pending peer are queued
//! and flushed, in order, on the transition to `Ready`.
//!
//! Requests from the client are handled one at a time. Anything that concerns
//! other peers is forwarded to the room as a [`RoomEvent`].

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::SfuConfig;
use crate::engine::{
    Consumer, ConsumerOptions, DtlsParameters, MediaKind, MediaRouter, Producer,
    ProducerOptions, RtpCapabilities, RtpParameters, TransportParameters, WebRtcTransport,
};
use crate::error::{Result, SfuError};
use crate::inspector::Inspector;
use crate::room::RoomEvent;
use crate::signaling::{Ack, ClientRequest, InboundRequest, ServerEvent, SignalingChannel};
use crate::types::{PeerId, TrackId};

/// Direction of a WebRTC transport, seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Recv => f.write_str("recv"),
        }
    }
}

enum PeerState {
    /// Waiting for the `initialize` acknowledgement
    Pending(VecDeque<(ServerEvent, Value)>),
    Ready,
    Closed,
}

/// Acknowledgement of `initialize`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeReply {
    rtp_capabilities: RtpCapabilities,
    #[serde(default)]
    user_data: Value,
}

struct PeerInner {
    state: PeerState,
    rtp_capabilities: Option<RtpCapabilities>,
    user_data: Value,
    send_transport: Option<Arc<dyn WebRtcTransport>>,
    recv_transport: Option<Arc<dyn WebRtcTransport>>,
    producers: HashMap<TrackId, Arc<dyn Producer>>,
    /// Keyed by the id of the remote producer
    consumers: HashMap<TrackId, Arc<dyn Consumer>>,
    /// Consumers being negotiated with the client
    pending_consumers: HashSet<TrackId>,
    /// Remote producers this peer has a close observer on
    watched_producers: HashSet<TrackId>,
}

impl PeerInner {
    fn transport_slot(&mut self, direction: Direction) -> &mut Option<Arc<dyn WebRtcTransport>> {
        match direction {
            Direction::Send => &mut self.send_transport,
            Direction::Recv => &mut self.recv_transport,
        }
    }
}

/// SFU Peer - one participant's signaling session
pub struct SfuPeer {
    id: PeerId,
    channel: Arc<dyn SignalingChannel>,
    router: Arc<dyn MediaRouter>,
    config: Arc<SfuConfig>,
    room_events: mpsc::UnboundedSender<RoomEvent>,
    inspector: Option<Arc<Inspector>>,
    inner: Mutex<PeerInner>,
}

impl SfuPeer {
    pub(crate) fn new(
        id: PeerId,
        channel: Arc<dyn SignalingChannel>,
        router: Arc<dyn MediaRouter>,
        config: Arc<SfuConfig>,
        room_events: mpsc::UnboundedSender<RoomEvent>,
        inspector: Option<Arc<Inspector>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            channel,
            router,
            config,
            room_events,
            inspector,
            inner: Mutex::new(PeerInner {
                state: PeerState::Pending(VecDeque::new()),
                rtp_capabilities: None,
                user_data: Value::Null,
                send_transport: None,
                recv_transport: None,
                producers: HashMap::new(),
                consumers: HashMap::new(),
                pending_consumers: HashSet::new(),
                watched_producers: HashSet::new(),
            }),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.inner.lock().state, PeerState::Ready)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.lock().state, PeerState::Closed)
    }

    /// User metadata from the handshake (`null` until ready)
    #[must_use]
    pub fn user_data(&self) -> Value {
        self.inner.lock().user_data.clone()
    }

    #[must_use]
    pub fn producer(&self, track_id: &TrackId) -> Option<Arc<dyn Producer>> {
        self.inner.lock().producers.get(track_id).cloned()
    }

    #[must_use]
    pub fn consumer(&self, track_id: &TrackId) -> Option<Arc<dyn Consumer>> {
        self.inner.lock().consumers.get(track_id).cloned()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    /// Process inbound requests until the connection closes, then tear the
    /// peer down.
    pub(crate) fn start(self: &Arc<Self>, mut requests: mpsc::UnboundedReceiver<InboundRequest>) {
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                peer.handle_request(request).await;
            }
            debug!(peer_id = %peer.id, "Signaling connection closed");
            peer.close();
        });
    }

    /// Run the `initialize` handshake.
    ///
    /// On failure the peer stays pending and keeps queueing events. On timeout
    /// the connection is closed as well.
    pub async fn load(&self, init: Value) -> Result<()> {
        let request = self.channel.request(ServerEvent::Initialize, init);
        let reply = match self.config.handshake_timeout() {
            Some(limit) => match tokio::time::timeout(limit, request).await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!(
                        peer_id = %self.id,
                        timeout_ms = limit.as_millis() as u64,
                        "Handshake timed out, disconnecting"
                    );
                    self.channel.disconnect();
                    return Err(SfuError::Timeout(format!(
                        "peer {} did not answer initialize",
                        self.id
                    )));
                }
            },
            None => request.await,
        };

        let reply = reply.and_then(|v| Ok(serde_json::from_value::<HandshakeReply>(v)?));
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                error!(peer_id = %self.id, error = %e, "Handshake failed");
                return Err(e);
            }
        };

        let flushed = {
            let mut inner = self.inner.lock();
            let queued = match std::mem::replace(&mut inner.state, PeerState::Ready) {
                PeerState::Pending(queued) => queued,
                state => {
                    inner.state = state;
                    return Err(SfuError::AlreadyInState(format!(
                        "peer {} is no longer pending",
                        self.id
                    )));
                }
            };
            inner.rtp_capabilities = Some(reply.rtp_capabilities);
            inner.user_data = reply.user_data;

            let flushed = queued.len();
            for (event, payload) in queued {
                if let Err(e) = self.channel.send(event, payload) {
                    debug!(peer_id = %self.id, %event, error = %e, "Failed to flush event");
                }
            }
            flushed
        };

        info!(peer_id = %self.id, flushed, "Peer ready");
        let _ = self.room_events.send(RoomEvent::PeerReady {
            peer_id: self.id.clone(),
        });
        Ok(())
    }

    /// Deliver a broadcast event: immediately once ready, queued before that,
    /// dropped after the peer closed.
    pub fn emit_message(&self, event: ServerEvent, payload: Value) {
        let overflow = {
            let mut inner = self.inner.lock();
            match &mut inner.state {
                PeerState::Ready => {
                    if let Err(e) = self.channel.send(event, payload) {
                        debug!(peer_id = %self.id, %event, error = %e, "Failed to send event");
                    }
                    false
                }
                PeerState::Pending(queue) if queue.len() >= self.config.pending_event_capacity => {
                    true
                }
                PeerState::Pending(queue) => {
                    queue.push_back((event, payload));
                    false
                }
                PeerState::Closed => false,
            }
        };

        if overflow {
            warn!(
                peer_id = %self.id,
                capacity = self.config.pending_event_capacity,
                "Pending event queue full, disconnecting peer"
            );
            self.channel.disconnect();
        }
    }

    /// Close the signaling connection. The peer closes once its request
    /// stream ends.
    pub fn disconnect(&self) {
        self.channel.disconnect();
    }

    /// Tear down transports (and with them every producer and consumer) and
    /// tell the room. Idempotent.
    pub(crate) fn close(&self) {
        let transports = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, PeerState::Closed) {
                return;
            }
            inner.state = PeerState::Closed;
            [inner.send_transport.clone(), inner.recv_transport.clone()]
        };

        for transport in transports.into_iter().flatten() {
            transport.close();
        }

        let (producers, consumers) = {
            let mut inner = self.inner.lock();
            inner.send_transport = None;
            inner.recv_transport = None;
            (
                inner.producers.drain().map(|(_, p)| p).collect::<Vec<_>>(),
                inner.consumers.drain().map(|(_, c)| c).collect::<Vec<_>>(),
            )
        };
        for consumer in consumers {
            consumer.close();
        }
        for producer in producers {
            producer.close();
        }

        info!(peer_id = %self.id, "Peer disconnected");
        let _ = self.room_events.send(RoomEvent::PeerDisconnected {
            peer_id: self.id.clone(),
        });
    }

    async fn handle_request(self: &Arc<Self>, request: InboundRequest) {
        let InboundRequest { event, data, ack } = request;
        let request = match ClientRequest::parse(&event, data) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer_id = %self.id, event = %event, error = %e, "Rejected request");
                ack.err(e);
                return;
            }
        };

        match request {
            ClientRequest::NewProducer {
                kind,
                rtp_parameters,
                app_data,
            } => self.new_producer(kind, rtp_parameters, app_data, ack).await,
            // The room answers these. If the room is gone the ack is dropped
            // and answers with an error.
            ClientRequest::CreateConsumer {
                id,
                track_id,
                paused,
            } => {
                let _ = self.room_events.send(RoomEvent::ConsumeTrack {
                    peer_id: self.id.clone(),
                    remote_peer_id: id,
                    track_id,
                    paused,
                    ack,
                });
            }
            ClientRequest::Message(message) => {
                let _ = self.room_events.send(RoomEvent::Message {
                    peer_id: self.id.clone(),
                    message,
                    ack,
                });
            }
            request => {
                let result = self.dispatch(request).await;
                if let Err(e) = &result {
                    warn!(peer_id = %self.id, event = %event, error = %e, "Request failed");
                }
                ack.respond(result);
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, request: ClientRequest) -> Result<Value> {
        match request {
            ClientRequest::CreateRecvTransport {} => {
                Ok(serde_json::to_value(self.create_transport(Direction::Recv).await?)?)
            }
            ClientRequest::CreateSendTransport {} => {
                Ok(serde_json::to_value(self.create_transport(Direction::Send).await?)?)
            }
            ClientRequest::ConnectRecvTransport { dtls_parameters } => {
                self.connect_transport(Direction::Recv, dtls_parameters).await?;
                Ok(Value::Null)
            }
            ClientRequest::ConnectSendTransport { dtls_parameters } => {
                self.connect_transport(Direction::Send, dtls_parameters).await?;
                Ok(Value::Null)
            }
            ClientRequest::ProducerClosed { id } => {
                self.close_producer(&id);
                Ok(Value::Null)
            }
            ClientRequest::PauseProducer { id } => {
                self.pause_producer(&id).await?;
                Ok(Value::Null)
            }
            ClientRequest::ResumeProducer { id } => {
                self.resume_producer(&id).await?;
                Ok(Value::Null)
            }
            ClientRequest::PauseConsumer { track_id } => {
                self.pause_consumer(&track_id).await?;
                Ok(Value::Null)
            }
            ClientRequest::ResumeConsumer { track_id } => {
                self.resume_consumer(&track_id).await?;
                Ok(Value::Null)
            }
            ClientRequest::CloseConsumer { track_id } => {
                self.close_consumer(&track_id);
                Ok(Value::Null)
            }
            ClientRequest::NewProducer { .. }
            | ClientRequest::CreateConsumer { .. }
            | ClientRequest::Message(_) => Err(SfuError::InvalidRequest(
                "request is not handled by the peer".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    async fn create_transport(self: &Arc<Self>, direction: Direction) -> Result<TransportParameters> {
        let transport = self
            .router
            .create_webrtc_transport(&self.config.webrtc_transport.transport_options())
            .await?;

        let peer = Arc::downgrade(self);
        let transport_id = transport.id().to_string();
        transport.on_close(Box::new(move || {
            if let Some(peer) = peer.upgrade() {
                peer.on_transport_closed(direction, &transport_id);
            }
        }));

        let previous = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, PeerState::Closed) {
                None
            } else {
                Some(inner.transport_slot(direction).replace(Arc::clone(&transport)))
            }
        };
        let Some(previous) = previous else {
            transport.close();
            return Err(SfuError::NotReady(format!("peer {} is disconnected", self.id)));
        };

        if let Some(previous) = previous {
            debug!(peer_id = %self.id, %direction, transport_id = %previous.id(), "Replacing transport");
            previous.close();
        }

        debug!(peer_id = %self.id, %direction, transport_id = %transport.id(), "Transport created");
        Ok(transport.parameters())
    }

    async fn connect_transport(&self, direction: Direction, dtls_parameters: DtlsParameters) -> Result<()> {
        let transport = self
            .inner
            .lock()
            .transport_slot(direction)
            .clone()
            .ok_or_else(|| SfuError::NotFound(format!("{direction} transport")))?;
        transport.connect(dtls_parameters).await
    }

    fn on_transport_closed(&self, direction: Direction, transport_id: &str) {
        let (producers, consumers): (Vec<Arc<dyn Producer>>, Vec<Arc<dyn Consumer>>) = {
            let mut inner = self.inner.lock();
            let slot = inner.transport_slot(direction);
            if !slot.as_ref().is_some_and(|t| t.id() == transport_id) {
                // already replaced
                return;
            }
            *slot = None;
            match direction {
                Direction::Send => (inner.producers.drain().map(|(_, p)| p).collect(), Vec::new()),
                Direction::Recv => (Vec::new(), inner.consumers.drain().map(|(_, c)| c).collect()),
            }
        };

        debug!(
            peer_id = %self.id,
            %direction,
            producers = producers.len(),
            consumers = consumers.len(),
            "Transport closed"
        );
        for consumer in consumers {
            consumer.close();
        }
        for producer in producers {
            producer.close();
        }
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    async fn new_producer(
        self: &Arc<Self>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
        ack: Ack,
    ) {
        let producer = match self.open_producer(kind, rtp_parameters, app_data).await {
            Ok(producer) => producer,
            Err(e) => {
                warn!(peer_id = %self.id, error = %e, "Failed to create producer");
                ack.err(e);
                return;
            }
        };
        ack.ok(json!({ "id": producer.id() }));

        if kind == MediaKind::Video {
            if let Some(inspector) = &self.inspector {
                if let Err(e) = inspector.create_consumer(&producer).await {
                    warn!(peer_id = %self.id, track_id = %producer.id(), error = %e, "Inspector did not consume track");
                }
            }
        }

        let _ = self.room_events.send(RoomEvent::NewProducer {
            peer_id: self.id.clone(),
            producer: Arc::clone(&producer),
        });

        if let Err(e) = producer.resume().await {
            warn!(peer_id = %self.id, track_id = %producer.id(), error = %e, "Failed to resume producer");
        }
    }

    async fn open_producer(
        self: &Arc<Self>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<Arc<dyn Producer>> {
        let transport = self
            .inner
            .lock()
            .send_transport
            .clone()
            .ok_or_else(|| SfuError::NotFound("send transport".to_string()))?;

        let producer = transport
            .produce(ProducerOptions {
                kind,
                rtp_parameters,
                paused: true,
                app_data,
            })
            .await?;
        let track_id = TrackId::from(producer.id());

        let peer = Arc::downgrade(self);
        let key = track_id.clone();
        producer.on_close(Box::new(move || {
            if let Some(peer) = peer.upgrade() {
                peer.inner.lock().producers.remove(&key);
            }
        }));

        {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, PeerState::Closed) && !producer.closed() {
                inner.producers.insert(track_id.clone(), Arc::clone(&producer));
                drop(inner);
                info!(peer_id = %self.id, track_id = %track_id, %kind, "Producer created");
                return Ok(producer);
            }
        }

        producer.close();
        Err(SfuError::NotReady(format!("peer {} is disconnected", self.id)))
    }

    /// Close a producer at the client's request. Unknown ids are ignored.
    fn close_producer(&self, track_id: &TrackId) {
        let producer = self.inner.lock().producers.remove(track_id);
        if let Some(producer) = producer {
            debug!(peer_id = %self.id, track_id = %track_id, "Producer closed by client");
            producer.close();
        }
    }

    async fn pause_producer(&self, track_id: &TrackId) -> Result<()> {
        let producer = self
            .producer(track_id)
            .ok_or_else(|| SfuError::NotFound(format!("producer {track_id}")))?;
        if producer.paused() {
            return Err(SfuError::AlreadyInState(format!("producer {track_id} already paused")));
        }
        producer.pause().await
    }

    async fn resume_producer(&self, track_id: &TrackId) -> Result<()> {
        let producer = self
            .producer(track_id)
            .ok_or_else(|| SfuError::NotFound(format!("producer {track_id}")))?;
        if !producer.paused() {
            return Err(SfuError::AlreadyInState(format!("producer {track_id} not paused")));
        }
        producer.resume().await
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    /// Forward `producer` (owned by `remote_peer_id`) to this peer.
    ///
    /// The consumer is created paused and announced with `newConsumer`. It
    /// stays invisible to pause/resume cascades until the client acknowledged
    /// it, and is then resumed unless `paused` is set or the producer itself
    /// is paused at that point. Any failure leaves no consumer behind.
    pub async fn create_consumer(
        self: &Arc<Self>,
        remote_peer_id: &PeerId,
        producer: Arc<dyn Producer>,
        paused: bool,
    ) -> Result<()> {
        let track_id = TrackId::from(producer.id());
        let (transport, rtp_capabilities, first_consumer) = {
            let mut inner = self.inner.lock();
            let rtp_capabilities = match (&inner.state, &inner.rtp_capabilities) {
                (PeerState::Ready, Some(caps)) => caps.clone(),
                _ => return Err(SfuError::NotReady(format!("peer {} is not ready", self.id))),
            };
            let transport = inner
                .recv_transport
                .clone()
                .ok_or_else(|| SfuError::NotFound("recv transport".to_string()))?;
            if inner.consumers.contains_key(&track_id) || !inner.pending_consumers.insert(track_id.clone()) {
                return Err(SfuError::AlreadyInState(format!(
                    "already consuming track {track_id}"
                )));
            }
            let first_consumer = inner.watched_producers.insert(track_id.clone());
            (transport, rtp_capabilities, first_consumer)
        };

        if first_consumer {
            self.watch_producer(&producer, &track_id);
        }

        let result = async {
            let consumer = transport
                .consume(ConsumerOptions {
                    producer_id: producer.id().to_string(),
                    rtp_capabilities,
                    paused: true,
                    app_data: producer.app_data(),
                })
                .await?;
            self.watch_consumer(&consumer, &track_id);

            if let Err(e) = self
                .announce_consumer(remote_peer_id, &producer, &consumer, &track_id, paused)
                .await
            {
                self.forget_consumer(&track_id, consumer.id());
                consumer.close();
                return Err(e);
            }
            Ok(())
        }
        .await;

        self.inner.lock().pending_consumers.remove(&track_id);
        match &result {
            Ok(()) => info!(
                peer_id = %self.id,
                remote_peer_id = %remote_peer_id,
                track_id = %track_id,
                paused,
                "Consumer created"
            ),
            Err(e) => warn!(
                peer_id = %self.id,
                remote_peer_id = %remote_peer_id,
                track_id = %track_id,
                error = %e,
                "Failed to create consumer"
            ),
        }
        result
    }

    /// Close this peer's consumer of `producer` when the producer goes away.
    /// Registered once per remote producer.
    fn watch_producer(self: &Arc<Self>, producer: &Arc<dyn Producer>, track_id: &TrackId) {
        let peer = Arc::downgrade(self);
        let key = track_id.clone();
        producer.on_close(Box::new(move || {
            if let Some(peer) = peer.upgrade() {
                peer.on_remote_producer_closed(&key);
            }
        }));
    }

    fn on_remote_producer_closed(&self, track_id: &TrackId) {
        let consumer = {
            let mut inner = self.inner.lock();
            inner.watched_producers.remove(track_id);
            inner.consumers.remove(track_id)
        };
        if let Some(consumer) = consumer {
            debug!(peer_id = %self.id, track_id = %track_id, "Remote producer closed, closing consumer");
            consumer.close();
        }
    }

    /// Drop the consumer from the map when it closes
    fn watch_consumer(self: &Arc<Self>, consumer: &Arc<dyn Consumer>, track_id: &TrackId) {
        let peer = Arc::downgrade(self);
        let consumer_id = consumer.id().to_string();
        let key = track_id.clone();
        consumer.on_close(Box::new(move || {
            if let Some(peer) = peer.upgrade() {
                peer.forget_consumer(&key, &consumer_id);
            }
        }));
    }

    async fn announce_consumer(
        &self,
        remote_peer_id: &PeerId,
        producer: &Arc<dyn Producer>,
        consumer: &Arc<dyn Consumer>,
        track_id: &TrackId,
        paused: bool,
    ) -> Result<()> {
        if producer.closed() || consumer.closed() {
            return Err(SfuError::NotFound(format!("track {track_id} was closed")));
        }

        self.channel
            .request(
                ServerEvent::NewConsumer,
                json!({
                    "producerId": producer.id(),
                    "consumerId": consumer.id(),
                    "kind": consumer.kind(),
                    "rtpParameters": consumer.rtp_parameters(),
                    "type": consumer.consumer_type(),
                    "appData": consumer.app_data(),
                    "paused": paused || producer.paused(),
                    "id": remote_peer_id,
                }),
            )
            .await?;

        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, PeerState::Closed) {
                return Err(SfuError::NotReady(format!("peer {} is disconnected", self.id)));
            }
            if producer.closed() || consumer.closed() {
                return Err(SfuError::NotFound(format!("track {track_id} was closed")));
            }
            inner.consumers.insert(track_id.clone(), Arc::clone(consumer));
        }

        // the producer may have been paused or resumed while the client prepared
        if !paused && !producer.paused() {
            consumer.resume().await?;
        }
        Ok(())
    }

    fn forget_consumer(&self, track_id: &TrackId, consumer_id: &str) {
        let mut inner = self.inner.lock();
        if inner
            .consumers
            .get(track_id)
            .is_some_and(|c| c.id() == consumer_id)
        {
            inner.consumers.remove(track_id);
        }
    }

    async fn pause_consumer(&self, track_id: &TrackId) -> Result<()> {
        let consumer = self
            .consumer(track_id)
            .ok_or_else(|| SfuError::NotFound(format!("consumer of track {track_id}")))?;
        if consumer.paused() {
            return Err(SfuError::AlreadyInState(format!("consumer of track {track_id} already paused")));
        }
        consumer.pause().await
    }

    async fn resume_consumer(&self, track_id: &TrackId) -> Result<()> {
        let consumer = self
            .consumer(track_id)
            .ok_or_else(|| SfuError::NotFound(format!("consumer of track {track_id}")))?;
        if !consumer.paused() {
            return Err(SfuError::AlreadyInState(format!("consumer of track {track_id} not paused")));
        }
        consumer.resume().await
    }

    /// Follow a pause/resume of the remote producer. Peers not consuming the
    /// track, or already in the requested state, are left alone.
    pub(crate) async fn set_consumer_paused(&self, track_id: &TrackId, paused: bool) -> Result<()> {
        let Some(consumer) = self.consumer(track_id) else {
            return Ok(());
        };
        match (paused, consumer.paused()) {
            (true, false) => consumer.pause().await,
            (false, true) => consumer.resume().await,
            _ => Ok(()),
        }
    }

    /// Close the consumer of `track_id`, if any. Returns whether one existed.
    pub fn close_consumer(&self, track_id: &TrackId) -> bool {
        let consumer = self.inner.lock().consumers.remove(track_id);
        match consumer {
            Some(consumer) => {
                consumer.close();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, FakeRouter, MockClient};
    use crate::signaling::Connection;
    use std::time::Duration;

    struct Harness {
        peer: Arc<SfuPeer>,
        client: MockClient,
        events: mpsc::UnboundedReceiver<RoomEvent>,
    }

    fn harness(router: &Arc<FakeRouter>, config: SfuConfig) -> Harness {
        let (connection, client) = mock::connection();
        let Connection { channel, requests } = connection;
        let (tx, events) = mpsc::unbounded_channel();
        let peer = SfuPeer::new(
            PeerId::generate(),
            channel,
            router.clone(),
            Arc::new(config),
            tx,
            None,
        );
        peer.start(requests);
        Harness { peer, client, events }
    }

    async fn ready(harness: &mut Harness) {
        harness.peer.load(json!({ "id": harness.peer.id() })).await.unwrap();
        harness.client.expect_event(ServerEvent::Initialize).await;
        assert!(matches!(
            harness.events.recv().await,
            Some(RoomEvent::PeerReady { .. })
        ));
    }

    async fn produce(harness: &Harness, kind: &str) -> TrackId {
        harness
            .client
            .request("createSendTransport", Value::Null)
            .await
            .unwrap();
        let reply = harness
            .client
            .request(
                "newProducer",
                json!({ "kind": kind, "rtpParameters": {}, "appData": { "label": "cam" } }),
            )
            .await
            .unwrap();
        TrackId::from(reply["id"].as_str().unwrap())
    }

    #[tokio::test]
    async fn test_pending_events_flushed_in_order() {
        let router = FakeRouter::new("router-1");
        let mut h = harness(&router, SfuConfig::default());

        h.peer.emit_message(ServerEvent::PeerConnection, json!({ "n": 1 }));
        h.peer.emit_message(ServerEvent::PeerMessage, json!({ "n": 2 }));
        assert!(h.client.drain_events().is_empty());

        ready(&mut h).await;
        h.peer.emit_message(ServerEvent::PeerMessage, json!({ "n": 3 }));

        let order: Vec<_> = h.client.drain_events().into_iter().map(|e| e.data["n"].clone()).collect();
        assert_eq!(order, vec![json!(1), json!(2), json!(3)]);
        assert!(h.peer.is_ready());
    }

    #[tokio::test]
    async fn test_handshake_failure_stays_pending() {
        let router = FakeRouter::new("router-1");
        let mut h = harness(&router, SfuConfig::default());
        h.client.fail_handshake();

        assert!(h.peer.load(json!({})).await.is_err());
        assert!(!h.peer.is_ready());

        h.peer.emit_message(ServerEvent::PeerConnection, json!({}));
        // only the initialize request reached the client
        assert_eq!(h.client.drain_events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_disconnects() {
        let router = FakeRouter::new("router-1");
        let config = SfuConfig {
            handshake_timeout_ms: Some(1_000),
            ..SfuConfig::default()
        };
        let h = harness(&router, config);
        h.client.hold_handshake();

        let err = h.peer.load(json!({})).await.unwrap_err();
        assert!(matches!(err, SfuError::Timeout(_)));
        assert!(h.client.is_disconnected());
    }

    #[tokio::test]
    async fn test_queue_overflow_disconnects() {
        let router = FakeRouter::new("router-1");
        let config = SfuConfig {
            pending_event_capacity: 2,
            ..SfuConfig::default()
        };
        let mut h = harness(&router, config);

        for n in 0..3 {
            h.peer.emit_message(ServerEvent::PeerMessage, json!({ "n": n }));
        }
        assert!(h.client.is_disconnected());

        // the request stream ended, so the peer closes itself
        let event = tokio::time::timeout(Duration::from_secs(5), h.events.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(RoomEvent::PeerDisconnected { .. })));
        assert!(h.peer.is_closed());
    }

    #[tokio::test]
    async fn test_producer_requests() {
        let router = FakeRouter::new("router-1");
        let mut h = harness(&router, SfuConfig::default());
        ready(&mut h).await;

        let err = h
            .client
            .request("connectRecvTransport", json!({ "dtlsParameters": {} }))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NotFound(_)));

        let track_id = produce(&h, "audio").await;
        match h.events.recv().await {
            Some(RoomEvent::NewProducer { producer, .. }) => {
                assert_eq!(producer.id(), track_id.as_str());
                assert_eq!(producer.app_data(), json!({ "label": "cam" }));
            }
            _ => panic!("expected NewProducer"),
        }

        h.client.request("pauseProducer", json!({ "id": track_id })).await.unwrap();
        let err = h
            .client
            .request("pauseProducer", json!({ "id": track_id }))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::AlreadyInState(_)));
        h.client.request("resumeProducer", json!({ "id": track_id })).await.unwrap();

        h.client.request("producerClosed", json!({ "id": track_id })).await.unwrap();
        h.client.request("producerClosed", json!({ "id": track_id })).await.unwrap();
        assert!(h.peer.producer(&track_id).is_none());
        assert!(router.producer(track_id.as_str()).unwrap().closed());

        let err = h
            .client
            .request("resumeProducer", json!({ "id": track_id }))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_new_producer_without_transport() {
        let router = FakeRouter::new("router-1");
        let h = harness(&router, SfuConfig::default());

        let err = h
            .client
            .request("newProducer", json!({ "kind": "video", "rtpParameters": {} }))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NotFound(_)));

        let err = h.client.request("jump", json!({})).await.unwrap_err();
        assert!(matches!(err, SfuError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_create_consumer_lifecycle() {
        let router = FakeRouter::new("router-1");
        let mut owner = harness(&router, SfuConfig::default());
        let mut viewer = harness(&router, SfuConfig::default());
        ready(&mut owner).await;
        ready(&mut viewer).await;

        let track_id = produce(&owner, "video").await;
        let producer = owner.peer.producer(&track_id).unwrap();

        // no recv transport yet
        let err = viewer
            .peer
            .create_consumer(owner.peer.id(), Arc::clone(&producer), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NotFound(_)));

        viewer.client.request("createRecvTransport", Value::Null).await.unwrap();
        viewer
            .peer
            .create_consumer(owner.peer.id(), Arc::clone(&producer), false)
            .await
            .unwrap();

        let announced = viewer.client.expect_event(ServerEvent::NewConsumer).await;
        assert_eq!(announced["producerId"], json!(track_id));
        assert_eq!(announced["id"], json!(owner.peer.id()));
        assert_eq!(announced["type"], "simple");
        assert_eq!(announced["paused"], false);

        let consumer = viewer.peer.consumer(&track_id).unwrap();
        assert!(!consumer.paused());

        let err = viewer
            .peer
            .create_consumer(owner.peer.id(), Arc::clone(&producer), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::AlreadyInState(_)));

        viewer.client.request("pauseConsumer", json!({ "trackId": track_id })).await.unwrap();
        let err = viewer
            .client
            .request("pauseConsumer", json!({ "trackId": track_id }))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::AlreadyInState(_)));

        // closing the producer cascades to the consumer
        owner.client.request("producerClosed", json!({ "id": track_id })).await.unwrap();
        assert!(consumer.closed());
        assert_eq!(viewer.peer.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_reconsuming_does_not_accumulate_close_observers() {
        let router = FakeRouter::new("router-1");
        let mut owner = harness(&router, SfuConfig::default());
        let mut viewer = harness(&router, SfuConfig::default());
        ready(&mut owner).await;
        ready(&mut viewer).await;

        let track_id = produce(&owner, "video").await;
        let producer = owner.peer.producer(&track_id).unwrap();
        let fake_producer = router.producer(track_id.as_str()).unwrap();
        viewer.client.request("createRecvTransport", Value::Null).await.unwrap();

        let mut observers = None;
        for _ in 0..5 {
            viewer
                .peer
                .create_consumer(owner.peer.id(), Arc::clone(&producer), false)
                .await
                .unwrap();
            viewer.client.expect_event(ServerEvent::NewConsumer).await;
            let consumer = viewer.peer.consumer(&track_id).unwrap();
            let registered = fake_producer.close_observers();
            assert_eq!(*observers.get_or_insert(registered), registered);

            viewer.client.request("closeConsumer", json!({ "trackId": track_id })).await.unwrap();
            assert!(consumer.closed());
            assert_eq!(viewer.peer.consumer_count(), 0);
        }

        // the single observer still closes the latest consumer
        viewer
            .peer
            .create_consumer(owner.peer.id(), Arc::clone(&producer), false)
            .await
            .unwrap();
        let consumer = viewer.peer.consumer(&track_id).unwrap();
        owner.client.request("producerClosed", json!({ "id": track_id })).await.unwrap();
        assert!(consumer.closed());
        assert_eq!(viewer.peer.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_consumer_leaves_nothing_behind() {
        let router = FakeRouter::new("router-1");
        let mut owner = harness(&router, SfuConfig::default());
        let mut viewer = harness(&router, SfuConfig::default());
        ready(&mut owner).await;
        ready(&mut viewer).await;

        let track_id = produce(&owner, "audio").await;
        let producer = owner.peer.producer(&track_id).unwrap();
        viewer.client.request("createRecvTransport", Value::Null).await.unwrap();
        viewer.client.fail_new_consumer();

        let err = viewer
            .peer
            .create_consumer(owner.peer.id(), Arc::clone(&producer), true)
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::Signaling(_)));
        assert_eq!(viewer.peer.consumer_count(), 0);

        let recv = router.webrtc_transports().pop().unwrap();
        assert!(recv.consumers().iter().all(|c| c.closed()));
        assert!(!producer.closed());
    }

    #[tokio::test]
    async fn test_replacing_recv_transport_closes_consumers() {
        let router = FakeRouter::new("router-1");
        let mut owner = harness(&router, SfuConfig::default());
        let mut viewer = harness(&router, SfuConfig::default());
        ready(&mut owner).await;
        ready(&mut viewer).await;

        let track_id = produce(&owner, "video").await;
        let producer = owner.peer.producer(&track_id).unwrap();
        viewer.client.request("createRecvTransport", Value::Null).await.unwrap();
        viewer
            .peer
            .create_consumer(owner.peer.id(), producer, false)
            .await
            .unwrap();
        let consumer = viewer.peer.consumer(&track_id).unwrap();

        viewer.client.request("createRecvTransport", Value::Null).await.unwrap();
        assert!(consumer.closed());
        assert_eq!(viewer.peer.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_closes_everything() {
        let router = FakeRouter::new("router-1");
        let mut h = harness(&router, SfuConfig::default());
        ready(&mut h).await;

        let track_id = produce(&h, "audio").await;
        assert!(matches!(h.events.recv().await, Some(RoomEvent::NewProducer { .. })));

        h.client.disconnect();
        let event = tokio::time::timeout(Duration::from_secs(5), h.events.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(RoomEvent::PeerDisconnected { .. })));

        assert!(h.peer.is_closed());
        assert!(router.producer(track_id.as_str()).unwrap().closed());
        assert!(router.webrtc_transports().iter().all(|t| t.is_closed()));

        // events are dropped once closed
        h.peer.emit_message(ServerEvent::PeerMessage, json!({}));
    }
}
