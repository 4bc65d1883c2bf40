//! SFU Room management
//!
//! A room owns one media router and the peers connected to it. Everything a
//! peer or one of its producers reports reaches the room as a [`RoomEvent`]
//! and is handled by a single task, in arrival order.

use futures::future::try_join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SfuConfig;
use crate::engine::{MediaKind, MediaRouter, Producer};
use crate::error::{Result, SfuError};
use crate::inspector::Inspector;
use crate::peer::SfuPeer;
use crate::signaling::{Ack, Connection, ServerEvent};
use crate::types::{PeerId, RoomId, TrackId};

/// Signals from peers and producers, handled by the room task
pub(crate) enum RoomEvent {
    PeerReady {
        peer_id: PeerId,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    NewProducer {
        peer_id: PeerId,
        producer: Arc<dyn Producer>,
    },
    ProducerClosed {
        peer_id: PeerId,
        track_id: TrackId,
    },
    ProducerPaused {
        peer_id: PeerId,
        track_id: TrackId,
    },
    ProducerResumed {
        peer_id: PeerId,
        track_id: TrackId,
    },
    Message {
        peer_id: PeerId,
        message: Value,
        ack: Ack,
    },
    ConsumeTrack {
        peer_id: PeerId,
        remote_peer_id: PeerId,
        track_id: TrackId,
        paused: bool,
        ack: Ack,
    },
}

/// Snapshot of a room as shown to joining peers and the HTTP API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub app_data: Value,
    pub users_data: Vec<UserInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: PeerId,
    pub user_data: Value,
    pub available_tracks: Vec<TrackInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub track_id: TrackId,
    pub kind: MediaKind,
    pub paused: bool,
    pub custom_data: Value,
}

struct Member {
    peer: Arc<SfuPeer>,
    /// `peerConnection` was broadcast for this member
    announced: bool,
    /// Tracks the room advertises for this member
    tracks: IndexMap<TrackId, Arc<dyn Producer>>,
}

struct RoomState {
    members: IndexMap<PeerId, Member>,
    idle_timer: Option<JoinHandle<()>>,
    closed: bool,
}

impl RoomState {
    fn users_data(&self) -> Vec<UserInfo> {
        self.members
            .iter()
            .filter(|(_, member)| member.announced)
            .map(|(id, member)| UserInfo {
                id: id.clone(),
                user_data: member.peer.user_data(),
                available_tracks: member
                    .tracks
                    .iter()
                    .map(|(track_id, producer)| TrackInfo {
                        track_id: track_id.clone(),
                        kind: producer.kind(),
                        paused: producer.paused(),
                        custom_data: producer.app_data(),
                    })
                    .collect(),
            })
            .collect()
    }

    fn other_peers(&self, except: &PeerId) -> Vec<Arc<SfuPeer>> {
        self.members
            .iter()
            .filter(|(id, _)| *id != except)
            .map(|(_, member)| Arc::clone(&member.peer))
            .collect()
    }

    fn has_track(&self, peer_id: &PeerId, track_id: &TrackId) -> bool {
        self.members
            .get(peer_id)
            .is_some_and(|member| member.tracks.contains_key(track_id))
    }

    /// Send to every member except `except`. Called with the room lock held
    /// so the fan-out is atomic with respect to joins.
    fn broadcast(&self, event: ServerEvent, payload: &Value, except: Option<&PeerId>) {
        for (id, member) in &self.members {
            if Some(id) != except {
                member.peer.emit_message(event, payload.clone());
            }
        }
    }

    fn clear_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

/// SFU Room - a group of peers sharing tracks over one router
pub struct SfuRoom {
    id: RoomId,
    app_data: Value,
    router: Arc<dyn MediaRouter>,
    config: Arc<SfuConfig>,
    inspector: Option<Arc<Inspector>>,
    events: mpsc::UnboundedSender<RoomEvent>,
    idle_tx: mpsc::UnboundedSender<RoomId>,
    state: Mutex<RoomState>,
    shutdown: CancellationToken,
}

impl SfuRoom {
    /// Create a room and start its event task. The room starts empty, so its
    /// idle timer is armed right away; when it fires the room id is sent on
    /// `idle_tx`.
    pub fn new(
        id: RoomId,
        app_data: Value,
        router: Arc<dyn MediaRouter>,
        config: Arc<SfuConfig>,
        inspector: Option<Arc<Inspector>>,
        idle_tx: mpsc::UnboundedSender<RoomId>,
    ) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let room = Arc::new(Self {
            id,
            app_data,
            router,
            config,
            inspector,
            events,
            idle_tx,
            state: Mutex::new(RoomState {
                members: IndexMap::new(),
                idle_timer: None,
                closed: false,
            }),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_events(
            Arc::downgrade(&room),
            events_rx,
            room.shutdown.clone(),
        ));
        room.restart_idle_timer(&mut room.state.lock());

        room
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub const fn app_data(&self) -> &Value {
        &self.app_data
    }

    #[must_use]
    pub fn inspector(&self) -> Option<&Arc<Inspector>> {
        self.inspector.as_ref()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.state.lock().members.len()
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<SfuPeer>> {
        self.state
            .lock()
            .members
            .get(peer_id)
            .map(|member| Arc::clone(&member.peer))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[must_use]
    pub fn idle_timer_armed(&self) -> bool {
        self.state
            .lock()
            .idle_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Announced members and their advertised tracks
    #[must_use]
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            app_data: self.app_data.clone(),
            users_data: self.state.lock().users_data(),
        }
    }

    /// Start the inspector in the background. Failures are logged.
    pub fn load(&self) {
        let Some(inspector) = self.inspector.clone() else {
            return;
        };
        let room_id = self.id.clone();
        let mut failures = inspector.failures();

        tokio::spawn(async move {
            if let Err(e) = inspector.load().await {
                error!(room_id = %room_id, error = %e, "Failed to load inspector");
                return;
            }
            drop(inspector);
            if let Ok(reason) = failures.recv().await {
                warn!(room_id = %room_id, %reason, "Inspector stopped");
            }
        });
    }

    /// Register a new connection as a peer and run its handshake.
    ///
    /// Returns once the handshake finished; a failed handshake is logged and
    /// leaves the peer pending. On error the caller still owns disconnecting
    /// the connection.
    pub async fn add_peer(self: &Arc<Self>, connection: Connection) -> Result<PeerId> {
        let Connection { channel, requests } = connection;
        let peer_id = PeerId::generate();
        let peer = SfuPeer::new(
            peer_id.clone(),
            channel,
            Arc::clone(&self.router),
            Arc::clone(&self.config),
            self.events.clone(),
            self.inspector.clone(),
        );

        let users_data = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SfuError::NotFound(format!("room {}", self.id)));
            }
            let max_peers = self.config.max_peers_per_room;
            if max_peers > 0 && state.members.len() >= max_peers {
                warn!(
                    room_id = %self.id,
                    max_peers,
                    "Peer limit reached for room"
                );
                return Err(SfuError::RoomFull(format!(
                    "room {} has {max_peers} peers",
                    self.id
                )));
            }

            let users_data = state.users_data();
            state.members.insert(
                peer_id.clone(),
                Member {
                    peer: Arc::clone(&peer),
                    announced: false,
                    tracks: IndexMap::new(),
                },
            );
            state.clear_idle_timer();
            users_data
        };

        peer.start(requests);
        info!(
            room_id = %self.id,
            peer_id = %peer_id,
            known_peers = users_data.len(),
            "Peer joined room"
        );

        let init = json!({
            "id": peer_id,
            "routerRtpCapabilities": self.router.rtp_capabilities(),
            "appData": self.app_data,
            "usersData": users_data,
        });
        if let Err(e) = peer.load(init).await {
            debug!(room_id = %self.id, peer_id = %peer_id, error = %e, "Peer stays pending");
        }

        Ok(peer_id)
    }

    /// Close the room: disconnect every peer, close the router and stop the
    /// inspector. Idempotent.
    pub async fn close(&self) {
        let peers = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.clear_idle_timer();
            state
                .members
                .drain(..)
                .map(|(_, member)| member.peer)
                .collect::<Vec<_>>()
        };
        self.finish_close(peers).await;
    }

    /// Close the room only if nobody is in it. Returns whether it closed.
    pub async fn close_if_idle(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed || !state.members.is_empty() {
                return false;
            }
            state.closed = true;
            state.clear_idle_timer();
        }
        self.finish_close(Vec::new()).await;
        true
    }

    async fn finish_close(&self, peers: Vec<Arc<SfuPeer>>) {
        for peer in &peers {
            peer.disconnect();
        }
        self.router.close();
        if let Some(inspector) = &self.inspector {
            inspector.close().await;
        }
        self.shutdown.cancel();
        info!(room_id = %self.id, peers = peers.len(), "Room closed");
    }

    fn restart_idle_timer(&self, state: &mut RoomState) {
        state.clear_idle_timer();
        let room_id = self.id.clone();
        let idle_tx = self.idle_tx.clone();
        let timeout = self.config.idle_timeout();
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            info!(room_id = %room_id, "Room idle timeout exceeded");
            let _ = idle_tx.send(room_id);
        }));
    }

    async fn handle_event(self: &Arc<Self>, event: RoomEvent) {
        match event {
            RoomEvent::PeerReady { peer_id } => self.on_peer_ready(&peer_id),
            RoomEvent::PeerDisconnected { peer_id } => self.on_peer_disconnected(&peer_id),
            RoomEvent::NewProducer { peer_id, producer } => {
                self.on_new_producer(&peer_id, producer);
            }
            RoomEvent::ProducerClosed { peer_id, track_id } => {
                self.on_producer_closed(&peer_id, &track_id);
            }
            RoomEvent::ProducerPaused { peer_id, track_id } => {
                self.on_producer_paused(&peer_id, &track_id, true).await;
            }
            RoomEvent::ProducerResumed { peer_id, track_id } => {
                self.on_producer_paused(&peer_id, &track_id, false).await;
            }
            RoomEvent::Message {
                peer_id,
                message,
                ack,
            } => {
                self.state.lock().broadcast(
                    ServerEvent::PeerMessage,
                    &json!({ "id": peer_id, "message": message }),
                    Some(&peer_id),
                );
                ack.ok(Value::Null);
            }
            RoomEvent::ConsumeTrack {
                peer_id,
                remote_peer_id,
                track_id,
                paused,
                ack,
            } => self.on_consume_track(peer_id, remote_peer_id, &track_id, paused, ack),
        }
    }

    fn on_peer_ready(&self, peer_id: &PeerId) {
        let state = &mut *self.state.lock();
        let Some(member) = state.members.get_mut(peer_id) else {
            return;
        };
        if member.announced {
            return;
        }
        member.announced = true;

        let user_data = member.peer.user_data();
        let tracks: Vec<_> = member.tracks.values().cloned().collect();

        state.broadcast(
            ServerEvent::PeerConnection,
            &json!({ "id": peer_id, "userData": user_data }),
            Some(peer_id),
        );
        // tracks published before the handshake finished
        for producer in tracks {
            state.broadcast(
                ServerEvent::NewTrackAvailable,
                &track_payload(peer_id, producer.as_ref()),
                Some(peer_id),
            );
        }
        debug!(room_id = %self.id, peer_id = %peer_id, "Peer announced");
    }

    fn on_peer_disconnected(&self, peer_id: &PeerId) {
        let mut state = self.state.lock();
        let Some(member) = state.members.shift_remove(peer_id) else {
            return;
        };
        if member.announced {
            state.broadcast(ServerEvent::PeerDisconnection, &json!({ "id": peer_id }), None);
        }
        info!(
            room_id = %self.id,
            peer_id = %peer_id,
            remaining = state.members.len(),
            "Peer left room"
        );

        if state.members.is_empty() && !state.closed {
            self.restart_idle_timer(&mut state);
        }
    }

    fn on_new_producer(&self, peer_id: &PeerId, producer: Arc<dyn Producer>) {
        let track_id = TrackId::from(producer.id());

        let events = self.events.clone();
        let (owner, track) = (peer_id.clone(), track_id.clone());
        producer.on_close(Box::new(move || {
            let _ = events.send(RoomEvent::ProducerClosed {
                peer_id: owner,
                track_id: track,
            });
        }));

        let events = self.events.clone();
        let (owner, track) = (peer_id.clone(), track_id.clone());
        producer.on_pause(Box::new(move || {
            let _ = events.send(RoomEvent::ProducerPaused {
                peer_id: owner.clone(),
                track_id: track.clone(),
            });
        }));

        let events = self.events.clone();
        let (owner, track) = (peer_id.clone(), track_id.clone());
        producer.on_resume(Box::new(move || {
            let _ = events.send(RoomEvent::ProducerResumed {
                peer_id: owner.clone(),
                track_id: track.clone(),
            });
        }));

        if producer.closed() {
            debug!(room_id = %self.id, track_id = %track_id, "Producer closed before it was advertised");
            return;
        }

        let state = &mut *self.state.lock();
        let Some(member) = state.members.get_mut(peer_id) else {
            return;
        };
        member.tracks.insert(track_id.clone(), Arc::clone(&producer));
        let announced = member.announced;

        if announced {
            state.broadcast(
                ServerEvent::NewTrackAvailable,
                &track_payload(peer_id, producer.as_ref()),
                Some(peer_id),
            );
        }
        info!(room_id = %self.id, peer_id = %peer_id, track_id = %track_id, "Track available");
    }

    fn on_producer_closed(&self, peer_id: &PeerId, track_id: &TrackId) {
        let peers = {
            let mut state = self.state.lock();
            let removed = state
                .members
                .get_mut(peer_id)
                .and_then(|member| member.tracks.shift_remove(track_id));
            if removed.is_none() {
                return;
            }
            state.other_peers(peer_id)
        };

        let closed = peers
            .iter()
            .filter(|peer| peer.close_consumer(track_id))
            .count();

        self.state.lock().broadcast(
            ServerEvent::ConsumerClosed,
            &json!({ "id": peer_id, "trackId": track_id }),
            Some(peer_id),
        );
        info!(
            room_id = %self.id,
            peer_id = %peer_id,
            track_id = %track_id,
            consumers = closed,
            "Track closed"
        );
    }

    async fn on_producer_paused(&self, peer_id: &PeerId, track_id: &TrackId, paused: bool) {
        let peers = {
            let state = self.state.lock();
            if !state.has_track(peer_id, track_id) {
                return;
            }
            state.other_peers(peer_id)
        };

        let updates = peers
            .iter()
            .map(|peer| peer.set_consumer_paused(track_id, paused));
        if let Err(e) = try_join_all(updates).await {
            warn!(
                room_id = %self.id,
                track_id = %track_id,
                paused,
                error = %e,
                "Failed to update consumers"
            );
            return;
        }

        let event = if paused {
            ServerEvent::ConsumerPaused
        } else {
            ServerEvent::ConsumerResumed
        };
        let state = self.state.lock();
        if state.has_track(peer_id, track_id) {
            state.broadcast(
                event,
                &json!({ "id": peer_id, "trackId": track_id }),
                Some(peer_id),
            );
        }
    }

    fn on_consume_track(
        &self,
        peer_id: PeerId,
        remote_peer_id: PeerId,
        track_id: &TrackId,
        paused: bool,
        ack: Ack,
    ) {
        let resolved = {
            let state = self.state.lock();
            state
                .members
                .get(&peer_id)
                .map(|member| Arc::clone(&member.peer))
                .ok_or_else(|| SfuError::NotFound(format!("peer {peer_id}")))
                .and_then(|requester| {
                    let remote = state
                        .members
                        .get(&remote_peer_id)
                        .ok_or_else(|| SfuError::NotFound(format!("peer {remote_peer_id}")))?;
                    let producer = remote.peer.producer(track_id).ok_or_else(|| {
                        SfuError::NotFound(format!("peer {remote_peer_id} has no track {track_id}"))
                    })?;
                    Ok((requester, producer))
                })
        };

        let (requester, producer) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(room_id = %self.id, peer_id = %peer_id, error = %e, "Cannot consume track");
                ack.err(e);
                return;
            }
        };

        // waits for the client to acknowledge newConsumer, so keep it off the
        // room task
        tokio::spawn(async move {
            let result = requester
                .create_consumer(&remote_peer_id, producer, paused)
                .await;
            ack.respond(result.map(|()| Value::Null));
        });
    }
}

impl Drop for SfuRoom {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.state.get_mut().clear_idle_timer();
    }
}

fn track_payload(peer_id: &PeerId, producer: &dyn Producer) -> Value {
    json!({
        "id": peer_id,
        "trackId": producer.id(),
        "kind": producer.kind(),
        "customData": producer.app_data(),
    })
}

async fn run_events(
    room: Weak<SfuRoom>,
    mut events: mpsc::UnboundedReceiver<RoomEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(room) = room.upgrade() else {
            break;
        };
        room.handle_event(event).await;
    }
}
