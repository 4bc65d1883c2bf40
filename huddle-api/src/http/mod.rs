// Module: http
// JSON gateway for room management and the WebSocket signaling endpoint

pub mod error;
pub mod health;
pub mod room;
pub mod websocket;

use axum::{routing::get, Router};
use huddle_sfu::SfuManager;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SfuManager>,
    /// Largest WebSocket frame accepted from a client, in bytes
    pub max_message_size: usize,
}

impl AppState {
    pub fn new(manager: Arc<SfuManager>, max_message_size: usize) -> Self {
        Self {
            manager,
            max_message_size,
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .merge(room::create_room_router())
        .route("/api/v1/ws", get(websocket::websocket_handler))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "HTTP server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
