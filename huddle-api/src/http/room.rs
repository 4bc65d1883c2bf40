// Room management HTTP handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use huddle_sfu::RoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AppResult, AppState};

/// Create room request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: RoomId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomResponse {
    pub app_data: Value,
}

pub fn create_room_router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/room", post(create_room))
        .route("/api/v1/rooms/{room_id}", get(get_room))
}

/// Create a room carrying opaque `appData`
pub async fn create_room(
    State(state): State<AppState>,
    Json(req): Json<CreateRoomRequest>,
) -> AppResult<(StatusCode, Json<CreateRoomResponse>)> {
    let room_id = state.manager.create_room(req.app_data).await?;
    Ok((StatusCode::CREATED, Json(CreateRoomResponse { room_id })))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomResponse>> {
    let app_data = state.manager.room_app_data(&RoomId::new(room_id))?;
    Ok(Json(RoomResponse { app_data }))
}
