//! WebSocket upgrade handler.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chat_common::{Event, EventType, Message};
use metrics::gauge;
use serde::Deserialize;

use crate::error::ApiError;
use crate::metrics::ACTIVE_CONNECTIONS;
use crate::AppState;

use super::connection::Connection;

/// Close code sent when the initial join is rejected.
const CLOSE_JOIN_FAILED: u16 = 4000;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub username: Option<String>,
    pub roomid: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin) {
        tracing::warn!(?origin, "websocket origin rejected");
        return ApiError::forbidden("Origin not allowed").into_response();
    }

    let username = params.username.filter(|u| !u.trim().is_empty());
    let room_id = params.roomid.filter(|r| !r.trim().is_empty());
    let (Some(username), Some(room_id)) = (username, room_id) else {
        return ApiError::bad_request("username and roomid are required").into_response();
    };

    let max_message_size = state.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_connection(socket, state, username, room_id))
}

async fn handle_connection(mut socket: WebSocket, state: AppState, username: String, room_id: String) {
    let hub = state.hub.clone();
    let conn = Connection::new(username, state.config.connection_settings());

    let join = Event::new(
        EventType::JoinRoom,
        Message {
            room_id: room_id.clone(),
            ..Message::default()
        },
    );
    if let Err(err) = hub.process_event(join, &conn).await {
        tracing::info!(conn_id = %conn.id(), room_id = %room_id, %err, "initial join rejected");
        let _ = send_close(&mut socket, CLOSE_JOIN_FAILED, &err.to_string()).await;
        conn.close();
        return;
    }

    gauge!(ACTIVE_CONNECTIONS).increment(1.0);
    tracing::info!(
        conn_id = %conn.id(),
        username = %conn.username(),
        room_id = %room_id,
        "websocket connection established"
    );

    conn.clone().run(socket, hub.clone()).await;

    hub.disconnect(&conn).await;
    gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
    tracing::info!(conn_id = %conn.id(), username = %conn.username(), "websocket connection ended");
}

async fn send_close(socket: &mut WebSocket, code: u16, reason: &str) -> Result<(), axum::Error> {
    // Close reasons are capped at 123 bytes on the wire.
    let mut end = reason.len().min(120);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let frame = CloseFrame {
        code,
        reason: reason[..end].to_string().into(),
    };
    socket.send(WsMessage::Close(Some(frame))).await
}
