pub mod health;
pub mod metrics;
pub mod rooms;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(metrics::router())
        .merge(crate::hub::server::router())
        .nest("/api/v1", rooms::router())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        rooms::create_room,
        rooms::room_stats,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::hub::RoomStats,
            health::HealthResponse,
            rooms::CreateRoomResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Rooms", description = "Room management"),
    )
)]
pub struct ApiDoc;
