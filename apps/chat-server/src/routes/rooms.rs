//! Room endpoints.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::Rng;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::error::{ApiError, ApiErrorBody, HubError};
use crate::hub::RoomStats;
use crate::AppState;

/// Random ids are retried this many times before giving up with a conflict.
const CREATE_ATTEMPTS: usize = 3;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/stats", get(room_stats))
}

fn generate_room_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..5)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

// ---------------------------------------------------------------------------
// POST /api/v1/rooms
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CreateRoomParams {
    /// Display name of the creator.
    pub username: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateRoomResponse {
    pub message: String,
    /// The generated room id.
    pub data: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/rooms",
    tag = "Rooms",
    params(CreateRoomParams),
    responses(
        (status = 201, description = "Room created", body = CreateRoomResponse),
        (status = 400, description = "Missing username", body = ApiErrorBody),
        (status = 409, description = "Room id already taken", body = ApiErrorBody),
        (status = 503, description = "Backplane unavailable", body = ApiErrorBody),
    ),
)]
pub async fn create_room(
    State(state): State<AppState>,
    Query(params): Query<CreateRoomParams>,
) -> Result<(StatusCode, Json<CreateRoomResponse>), ApiError> {
    let username = params
        .username
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Username is required"))?;

    let mut last_err = None;
    for _ in 0..CREATE_ATTEMPTS {
        let room_id = generate_room_id();
        match state.hub.create_room(&room_id, &username).await {
            Ok(()) => {
                return Ok((
                    StatusCode::CREATED,
                    Json(CreateRoomResponse {
                        message: "Room created successfully".to_string(),
                        data: room_id,
                    }),
                ));
            }
            Err(err @ HubError::RoomAlreadyExists(_)) => {
                tracing::debug!(room_id = %room_id, "generated room id taken, retrying");
                last_err = Some(err);
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(last_err
        .map(ApiError::from)
        .unwrap_or_else(|| ApiError::internal("Failed to create room")))
}

// ---------------------------------------------------------------------------
// GET /api/v1/rooms/stats
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/rooms/stats",
    tag = "Rooms",
    responses(
        (status = 200, description = "Rooms hosted by this server", body = RoomStats),
    ),
)]
pub async fn room_stats(State(state): State<AppState>) -> Json<RoomStats> {
    Json(state.hub.room_stats())
}
