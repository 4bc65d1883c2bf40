//! In-memory media engine and signaling client
//!
//! Used by the crate's own tests and by embedders that want to exercise the
//! orchestration layer without a real media engine. Handles behave like the
//! real thing where the SFU cares: closing is idempotent, callbacks fire once
//! and outside of internal locks, and closing a transport closes everything
//! created on it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::engine::{
    CloseCallback, Consumer, ConsumerOptions, DtlsParameters, MediaKind, MediaRouter,
    MediaWorker, PlainTransport, PlainTransportOptions, Producer, ProducerOptions,
    RouterOptions, RtpCapabilities, RtpCodecCapability, RtpParameters, StateCallback, Transport,
    TransportParameters, WebRtcTransport, WebRtcTransportOptions, WorkerResourceUsage,
};
use crate::error::{Result, SfuError};
use crate::signaling::{Ack, Connection, InboundRequest, ServerEvent, SignalingChannel};

/// How long the fake client waits for an answer or an event
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

fn fake_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

type SharedCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks registered on a handle, fired without holding the handle's lock
#[derive(Default)]
struct Callbacks {
    close: Mutex<Vec<CloseCallback>>,
    pause: Mutex<Vec<SharedCallback>>,
    resume: Mutex<Vec<SharedCallback>>,
}

impl Callbacks {
    fn fire_close(&self) {
        let callbacks = std::mem::take(&mut *self.close.lock());
        for callback in callbacks {
            callback();
        }
    }

    fn fire(list: &Mutex<Vec<SharedCallback>>) {
        let callbacks = list.lock().clone();
        for callback in callbacks {
            callback();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct FakeWorker {
    id: String,
    utime: AtomicU64,
    failing: AtomicBool,
    routers: Mutex<Vec<Arc<FakeRouter>>>,
}

impl FakeWorker {
    pub fn new(id: &str, utime: u64) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            utime: AtomicU64::new(utime),
            failing: AtomicBool::new(false),
            routers: Mutex::new(Vec::new()),
        })
    }

    pub fn set_utime(&self, utime: u64) {
        self.utime.store(utime, Ordering::SeqCst);
    }

    /// Make every call on this worker fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn routers(&self) -> Vec<Arc<FakeRouter>> {
        self.routers.lock().clone()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SfuError::Engine(format!("worker {} is unavailable", self.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaWorker for FakeWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn resource_usage(&self) -> Result<WorkerResourceUsage> {
        self.check()?;
        Ok(WorkerResourceUsage {
            ru_utime: self.utime.load(Ordering::SeqCst),
            ru_stime: 0,
        })
    }

    async fn create_router(&self, options: &RouterOptions) -> Result<Arc<dyn MediaRouter>> {
        self.check()?;
        let router = FakeRouter::with_codecs(&fake_id("router"), options.media_codecs.clone());
        self.routers.lock().push(Arc::clone(&router));
        Ok(router)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct FakeRouter {
    id: String,
    me: Weak<FakeRouter>,
    codecs: Vec<RtpCodecCapability>,
    closed: AtomicBool,
    fail_transports: AtomicBool,
    producers: Mutex<HashMap<String, Arc<FakeProducer>>>,
    webrtc_transports: Mutex<Vec<Arc<FakeTransport>>>,
    plain_transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeRouter {
    pub fn new(id: &str) -> Arc<Self> {
        Self::with_codecs(id, Vec::new())
    }

    pub fn with_codecs(id: &str, codecs: Vec<RtpCodecCapability>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: id.to_string(),
            me: me.clone(),
            codecs,
            closed: AtomicBool::new(false),
            fail_transports: AtomicBool::new(false),
            producers: Mutex::new(HashMap::new()),
            webrtc_transports: Mutex::new(Vec::new()),
            plain_transports: Mutex::new(Vec::new()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_fail_transports(&self, fail: bool) {
        self.fail_transports.store(fail, Ordering::SeqCst);
    }

    pub fn webrtc_transports(&self) -> Vec<Arc<FakeTransport>> {
        self.webrtc_transports.lock().clone()
    }

    pub fn plain_transports(&self) -> Vec<Arc<FakeTransport>> {
        self.plain_transports.lock().clone()
    }

    pub fn producer(&self, id: &str) -> Option<Arc<FakeProducer>> {
        self.producers.lock().get(id).cloned()
    }

    /// A producer registered on the router but owned by no transport
    pub fn standalone_producer(&self, kind: MediaKind) -> Arc<FakeProducer> {
        let producer = FakeProducer::new(kind, Value::Null, false);
        self.register(&producer);
        producer
    }

    fn register(&self, producer: &Arc<FakeProducer>) {
        self.producers
            .lock()
            .insert(producer.id.clone(), Arc::clone(producer));
    }

    fn new_transport(&self) -> Result<Arc<FakeTransport>> {
        if self.is_closed() {
            return Err(SfuError::Engine(format!("router {} is closed", self.id)));
        }
        if self.fail_transports.load(Ordering::SeqCst) {
            return Err(SfuError::Engine("transport creation failed".to_string()));
        }
        Ok(FakeTransport::new(self.me.clone()))
    }
}

#[async_trait]
impl MediaRouter for FakeRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        json!({ "codecs": self.codecs, "headerExtensions": [] })
    }

    async fn create_webrtc_transport(
        &self,
        _options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>> {
        let transport = self.new_transport()?;
        self.webrtc_transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }

    async fn create_plain_transport(
        &self,
        _options: &PlainTransportOptions,
    ) -> Result<Arc<dyn PlainTransport>> {
        let transport = self.new_transport()?;
        self.plain_transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut transports = self.webrtc_transports();
        transports.extend(self.plain_transports());
        for transport in transports {
            transport.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct FakeTransport {
    id: String,
    router: Weak<FakeRouter>,
    closed: AtomicBool,
    fail_consume: AtomicBool,
    dtls: Mutex<Option<DtlsParameters>>,
    remote: Mutex<Option<(IpAddr, u16)>>,
    producers: Mutex<Vec<Arc<FakeProducer>>>,
    consumers: Mutex<Vec<Arc<FakeConsumer>>>,
    consume_requests: Mutex<Vec<ConsumerOptions>>,
    callbacks: Callbacks,
}

impl FakeTransport {
    fn new(router: Weak<FakeRouter>) -> Arc<Self> {
        Arc::new(Self {
            id: fake_id("transport"),
            router,
            closed: AtomicBool::new(false),
            fail_consume: AtomicBool::new(false),
            dtls: Mutex::new(None),
            remote: Mutex::new(None),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            consume_requests: Mutex::new(Vec::new()),
            callbacks: Callbacks::default(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Every `consume` call seen so far, including failed ones
    pub fn consume_requests(&self) -> Vec<ConsumerOptions> {
        self.consume_requests.lock().clone()
    }

    pub fn set_fail_consume(&self, fail: bool) {
        self.fail_consume.store(fail, Ordering::SeqCst);
    }

    /// DTLS parameters given to `connect`, for WebRTC transports
    pub fn dtls_parameters(&self) -> Option<DtlsParameters> {
        self.dtls.lock().clone()
    }

    /// Remote address given to `connect`, for plain transports
    pub fn connected_to(&self) -> Option<(IpAddr, u16)> {
        *self.remote.lock()
    }

    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        self.producers.lock().clone()
    }

    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.consumers.lock().clone()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(SfuError::Engine(format!("transport {} is closed", self.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>> {
        self.check_open()?;
        let producer = FakeProducer::new(options.kind, options.app_data, options.paused);
        if let Some(router) = self.router.upgrade() {
            router.register(&producer);
        }
        self.producers.lock().push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>> {
        self.check_open()?;
        self.consume_requests.lock().push(options.clone());
        if self.fail_consume.load(Ordering::SeqCst) {
            return Err(SfuError::Engine("consume failed".to_string()));
        }

        let producer = self
            .router
            .upgrade()
            .and_then(|router| router.producer(&options.producer_id))
            .filter(|producer| !producer.closed())
            .ok_or_else(|| {
                SfuError::Engine(format!("producer {} not found", options.producer_id))
            })?;

        let consumer = FakeConsumer::new(&producer, options.app_data, options.paused);
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let producers = std::mem::take(&mut *self.producers.lock());
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            consumer.close();
        }
        for producer in producers {
            producer.close();
        }
        self.callbacks.fire_close();
    }

    fn on_close(&self, callback: CloseCallback) {
        if !self.is_closed() {
            self.callbacks.close.lock().push(callback);
        }
    }
}

#[async_trait]
impl WebRtcTransport for FakeTransport {
    fn parameters(&self) -> TransportParameters {
        TransportParameters {
            id: self.id.clone(),
            ice_parameters: json!({ "usernameFragment": "fake", "password": "fake", "iceLite": true }),
            ice_candidates: json!([]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
            sctp_parameters: None,
        }
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        self.check_open()?;
        *self.dtls.lock() = Some(dtls_parameters);
        Ok(())
    }
}

#[async_trait]
impl PlainTransport for FakeTransport {
    async fn connect(&self, ip: IpAddr, port: u16) -> Result<()> {
        self.check_open()?;
        *self.remote.lock() = Some((ip, port));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Producer / Consumer
// ---------------------------------------------------------------------------

pub struct FakeProducer {
    id: String,
    kind: MediaKind,
    app_data: Value,
    paused: AtomicBool,
    closed: AtomicBool,
    callbacks: Callbacks,
}

impl FakeProducer {
    fn new(kind: MediaKind, app_data: Value, paused: bool) -> Arc<Self> {
        Arc::new(Self {
            id: fake_id("producer"),
            kind,
            app_data,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            callbacks: Callbacks::default(),
        })
    }

    /// Number of close callbacks still registered
    pub fn close_observers(&self) -> usize {
        self.callbacks.close.lock().len()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed() {
            Err(SfuError::Engine(format!("producer {} is closed", self.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Producer for FakeProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn app_data(&self) -> Value {
        self.app_data.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<()> {
        self.check_open()?;
        if !self.paused.swap(true, Ordering::SeqCst) {
            Callbacks::fire(&self.callbacks.pause);
        }
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.check_open()?;
        if self.paused.swap(false, Ordering::SeqCst) {
            Callbacks::fire(&self.callbacks.resume);
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.callbacks.fire_close();
        }
    }

    fn on_close(&self, callback: CloseCallback) {
        let mut close = self.callbacks.close.lock();
        if !self.closed() {
            close.push(callback);
        }
    }

    fn on_pause(&self, callback: StateCallback) {
        self.callbacks.pause.lock().push(Arc::from(callback));
    }

    fn on_resume(&self, callback: StateCallback) {
        self.callbacks.resume.lock().push(Arc::from(callback));
    }
}

pub struct FakeConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    app_data: Value,
    paused: AtomicBool,
    closed: AtomicBool,
    callbacks: Callbacks,
}

impl FakeConsumer {
    fn new(producer: &FakeProducer, app_data: Value, paused: bool) -> Arc<Self> {
        Arc::new(Self {
            id: fake_id("consumer"),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            app_data,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            callbacks: Callbacks::default(),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed() {
            Err(SfuError::Engine(format!("consumer {} is closed", self.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Consumer for FakeConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        json!({ "codecs": [], "encodings": [{ "ssrc": 1111 }] })
    }

    fn consumer_type(&self) -> &str {
        "simple"
    }

    fn app_data(&self) -> Value {
        self.app_data.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<()> {
        self.check_open()?;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.check_open()?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.callbacks.fire_close();
        }
    }

    fn on_close(&self, callback: CloseCallback) {
        let mut close = self.callbacks.close.lock();
        if !self.closed() {
            close.push(callback);
        }
    }
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

/// Something the server sent to the fake client
#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub event: ServerEvent,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelControl {
    handshake_held: bool,
    new_consumer_held: bool,
    disconnected: bool,
}

impl ChannelControl {
    const fn holds(&self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::Initialize => self.handshake_held,
            ServerEvent::NewConsumer => self.new_consumer_held,
            _ => false,
        }
    }
}

/// Server side of an in-memory signaling connection
pub struct MockChannel {
    events: mpsc::UnboundedSender<ClientEvent>,
    inbound: Mutex<Option<mpsc::UnboundedSender<InboundRequest>>>,
    control: watch::Sender<ChannelControl>,
    handshake_reply: Mutex<std::result::Result<Value, String>>,
    fail_new_consumer: AtomicBool,
}

#[async_trait]
impl SignalingChannel for MockChannel {
    fn send(&self, event: ServerEvent, payload: Value) -> Result<()> {
        if self.control.borrow().disconnected {
            return Err(SfuError::Signaling("connection closed".to_string()));
        }
        self.events
            .send(ClientEvent {
                event,
                data: payload,
            })
            .map_err(|_| SfuError::Signaling("client is gone".to_string()))
    }

    async fn request(&self, event: ServerEvent, payload: Value) -> Result<Value> {
        self.send(event, payload)?;

        let mut control = self.control.subscribe();
        let disconnected = control
            .wait_for(|c| c.disconnected || !c.holds(event))
            .await
            .map(|c| c.disconnected)
            .unwrap_or(true);
        if disconnected {
            return Err(SfuError::Signaling("connection closed".to_string()));
        }

        match event {
            ServerEvent::Initialize => self
                .handshake_reply
                .lock()
                .clone()
                .map_err(SfuError::Signaling),
            ServerEvent::NewConsumer if self.fail_new_consumer.load(Ordering::SeqCst) => Err(
                SfuError::Signaling("client rejected the consumer".to_string()),
            ),
            _ => Ok(Value::Null),
        }
    }

    fn disconnect(&self) {
        self.control.send_modify(|c| c.disconnected = true);
        self.inbound.lock().take();
    }
}

/// Request half of a [`MockClient`]
#[derive(Clone)]
pub struct MockSender {
    channel: Arc<MockChannel>,
}

impl MockSender {
    pub async fn request(&self, event: &str, data: Value) -> Result<Value> {
        let inbound = self
            .channel
            .inbound
            .lock()
            .clone()
            .ok_or_else(|| SfuError::Signaling("connection closed".to_string()))?;

        let (tx, rx) = oneshot::channel();
        let ack = Ack::new(move |result| {
            let _ = tx.send(result);
        });
        inbound
            .send(InboundRequest {
                event: event.to_string(),
                data,
                ack,
            })
            .map_err(|_| SfuError::Signaling("server is gone".to_string()))?;
        drop(inbound);

        match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SfuError::Signaling("request was never answered".to_string())),
            Err(_) => Err(SfuError::Timeout(format!("no answer to {event}"))),
        }
    }
}

/// Client side of an in-memory signaling connection
pub struct MockClient {
    channel: Arc<MockChannel>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

/// Create a connected pair: the [`Connection`] to hand to the SFU and the
/// client that drives it.
pub fn connection() -> (Connection, MockClient) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (control, _) = watch::channel(ChannelControl::default());

    let channel = Arc::new(MockChannel {
        events: events_tx,
        inbound: Mutex::new(Some(inbound_tx)),
        control,
        handshake_reply: Mutex::new(Ok(json!({
            "rtpCapabilities": { "codecs": [] },
            "userData": {},
        }))),
        fail_new_consumer: AtomicBool::new(false),
    });

    let connection = Connection::new(Arc::clone(&channel) as Arc<dyn SignalingChannel>, inbound_rx);
    (
        connection,
        MockClient {
            channel,
            events: events_rx,
        },
    )
}

impl MockClient {
    /// User data returned in the `initialize` acknowledgement
    pub fn set_user_data(&self, user_data: Value) {
        *self.channel.handshake_reply.lock() = Ok(json!({
            "rtpCapabilities": { "codecs": [] },
            "userData": user_data,
        }));
    }

    /// Answer `initialize` with an error
    pub fn fail_handshake(&self) {
        *self.channel.handshake_reply.lock() = Err("handshake rejected".to_string());
    }

    /// Keep `initialize` unanswered until [`release_handshake`](Self::release_handshake)
    pub fn hold_handshake(&self) {
        self.channel.control.send_modify(|c| c.handshake_held = true);
    }

    pub fn release_handshake(&self) {
        self.channel.control.send_modify(|c| c.handshake_held = false);
    }

    /// Keep `newConsumer` requests unanswered until
    /// [`release_new_consumer`](Self::release_new_consumer)
    pub fn hold_new_consumer(&self) {
        self.channel.control.send_modify(|c| c.new_consumer_held = true);
    }

    pub fn release_new_consumer(&self) {
        self.channel.control.send_modify(|c| c.new_consumer_held = false);
    }

    /// Reject every `newConsumer` request
    pub fn fail_new_consumer(&self) {
        self.channel.fail_new_consumer.store(true, Ordering::SeqCst);
    }

    /// Send a request to the server and wait for its acknowledgement
    pub async fn request(&self, event: &str, data: Value) -> Result<Value> {
        self.sender().request(event, data).await
    }

    /// A handle that can send requests from another task
    pub fn sender(&self) -> MockSender {
        MockSender {
            channel: Arc::clone(&self.channel),
        }
    }

    /// Next event from the server, or `None` after the response timeout
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        tokio::time::timeout(RESPONSE_TIMEOUT, self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the next event and require it to be `event`
    pub async fn expect_event(&mut self, event: ServerEvent) -> Value {
        match self.next_event().await {
            Some(received) if received.event == event => received.data,
            other => panic!("expected {event}, got {other:?}"),
        }
    }

    /// Skip events until one of type `event` arrives
    pub async fn wait_for(&mut self, event: ServerEvent) -> Value {
        loop {
            match self.next_event().await {
                Some(received) if received.event == event => return received.data,
                Some(_) => {}
                None => panic!("timed out waiting for {event}"),
            }
        }
    }

    /// Events already delivered, without waiting
    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Close the connection from the client side
    pub fn disconnect(&self) {
        self.channel.disconnect();
    }

    pub fn is_disconnected(&self) -> bool {
        self.channel.control.borrow().disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_close_cascades() {
        let router = FakeRouter::new("router-1");
        let transport = router
            .create_webrtc_transport(&crate::config::WebRtcTransportConfig::default().transport_options())
            .await
            .unwrap();

        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let producer = transport
            .produce(ProducerOptions {
                kind: MediaKind::Audio,
                rtp_parameters: json!({}),
                paused: false,
                app_data: Value::Null,
            })
            .await
            .unwrap();
        producer.on_close(Box::new(move || flag.store(true, Ordering::SeqCst)));

        router.close();
        assert!(producer.closed());
        assert!(closed.load(Ordering::SeqCst));
        assert!(router.webrtc_transports()[0].is_closed());
    }

    #[tokio::test]
    async fn test_held_handshake_fails_on_disconnect() {
        let (connection, client) = connection();
        client.hold_handshake();

        let channel = Arc::clone(&connection.channel);
        let pending = tokio::spawn(async move {
            channel.request(ServerEvent::Initialize, json!({})).await
        });

        tokio::task::yield_now().await;
        client.disconnect();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(SfuError::Signaling(_))));
    }
}
