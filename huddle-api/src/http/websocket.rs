//! WebSocket signaling adapter
//!
//! Each socket becomes one peer's [`Connection`]. Frames are JSON text:
//!
//! - server push: `{event, data}`
//! - server request: `{event, data, ack: n}`, answered by the client with
//!   `{ack: n, data}` or `{ack: n, error}`
//! - client request: `{event, data, id?: n}`, answered by the server with
//!   `{id: n, error, data}` when `id` is present

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use huddle_sfu::{
    Ack, Connection, InboundRequest, Result, RoomId, ServerEvent, SfuError, SignalingChannel,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AppError, AppResult, AppState};

/// Frames queued for a slow client before sends start failing
const OUTBOUND_CAPACITY: usize = 1000;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "roomId")]
    pub room_id: String,
}

/// Frames a client may send
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClientFrame {
    Request {
        event: String,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        id: Option<u64>,
    },
    Reply {
        ack: u64,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        error: Option<Value>,
    },
}

/// [`SignalingChannel`] backed by a WebSocket
struct WsChannel {
    outbound: mpsc::Sender<Message>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    next_ack: AtomicU64,
    closed: CancellationToken,
}

impl WsChannel {
    fn new(outbound: mpsc::Sender<Message>) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(1),
            closed: CancellationToken::new(),
        }
    }

    fn push(&self, frame: &Value) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(SfuError::Signaling("connection closed".to_string()));
        }
        self.outbound
            .try_send(Message::Text(frame.to_string().into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    SfuError::Signaling("client too slow to consume messages".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    SfuError::Signaling("connection closed".to_string())
                }
            })
    }

    /// Route one text frame from the client
    fn dispatch(&self, text: &str, requests: &mpsc::UnboundedSender<InboundRequest>) {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed signaling frame");
                return;
            }
        };

        match frame {
            ClientFrame::Request { event, data, id } => {
                let ack = match id {
                    Some(id) => self.reply_ack(id),
                    None => Ack::noop(),
                };
                if requests.send(InboundRequest { event, data, ack }).is_err() {
                    debug!("Inbound request after the peer stopped listening");
                }
            }
            ClientFrame::Reply { ack, data, error } => {
                let Some(waiter) = self.pending.lock().remove(&ack) else {
                    debug!(ack, "Acknowledgement for unknown request");
                    return;
                };
                let result = match error {
                    Some(error) if !error.is_null() => Err(SfuError::Signaling(
                        error
                            .get("message")
                            .and_then(Value::as_str)
                            .map_or_else(|| error.to_string(), str::to_string),
                    )),
                    _ => Ok(data),
                };
                let _ = waiter.send(result);
            }
        }
    }

    fn reply_ack(&self, id: u64) -> Ack {
        let outbound = self.outbound.clone();
        Ack::new(move |result| {
            let frame = match result {
                Ok(data) => json!({ "id": id, "error": null, "data": data }),
                Err(e) => json!({ "id": id, "error": e.to_payload(), "data": null }),
            };
            if outbound
                .try_send(Message::Text(frame.to_string().into()))
                .is_err()
            {
                debug!(id, "Dropped acknowledgement for a closed connection");
            }
        })
    }

    /// Mark the socket closed and fail every request still waiting for an ack
    fn close(&self) {
        self.closed.cancel();
        self.pending.lock().clear();
    }
}

#[async_trait]
impl SignalingChannel for WsChannel {
    fn send(&self, event: ServerEvent, payload: Value) -> Result<()> {
        self.push(&json!({ "event": event.as_str(), "data": payload }))
    }

    async fn request(&self, event: ServerEvent, payload: Value) -> Result<Value> {
        let ack = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(ack, tx);

        if let Err(e) = self.push(&json!({ "event": event.as_str(), "data": payload, "ack": ack }))
        {
            self.pending.lock().remove(&ack);
            return Err(e);
        }
        // close() may have cleared the pending map before the insert
        if self.closed.is_cancelled() {
            self.pending.lock().remove(&ack);
            return Err(SfuError::Signaling("connection closed".to_string()));
        }

        rx.await
            .map_err(|_| SfuError::Signaling("connection closed".to_string()))?
    }

    fn disconnect(&self) {
        self.close();
    }
}

/// WebSocket handler: upgrade and join `roomId`
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let room_id = RoomId::new(query.room_id);
    if state.manager.room(&room_id).is_none() {
        return Err(AppError::not_found(format!("room {room_id}")));
    }

    Ok(ws
        .max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, room_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, room_id: RoomId) {
    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let channel = Arc::new(WsChannel::new(outbound_tx));

    tokio::spawn(write_loop(sink, outbound_rx, channel.closed.clone()));
    tokio::spawn(read_loop(stream, Arc::clone(&channel), requests_tx));

    let connection = Connection::new(
        Arc::clone(&channel) as Arc<dyn SignalingChannel>,
        requests_rx,
    );
    match state.manager.join_room(connection, &room_id).await {
        Ok(peer_id) => {
            info!(room_id = %room_id, peer_id = %peer_id, "WebSocket peer joined");
        }
        Err(e) => {
            warn!(room_id = %room_id, error = %e, "WebSocket peer failed to join");
            channel.disconnect();
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    channel: Arc<WsChannel>,
    requests: mpsc::UnboundedSender<InboundRequest>,
) {
    loop {
        let message = tokio::select! {
            () = channel.closed.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => channel.dispatch(text.as_str(), &requests),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(error = %e, "WebSocket read error");
                break;
            }
            Some(Ok(_)) => {}
        }
    }

    // Dropping `requests` ends the peer's inbound stream
    channel.close();
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Message>,
    closed: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => message,
            () = closed.cancelled() => None,
        };
        let Some(message) = message else { break };
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "WebSocket write error");
            closed.cancel();
            return;
        }
    }

    while let Ok(message) = outbound.try_recv() {
        if sink.send(message).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}
