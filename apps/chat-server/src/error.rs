use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Hub errors
// ---------------------------------------------------------------------------

/// Failures raised by the hub, its handlers and the broker clients.
///
/// Everything except [`HubError::ConnectionClosed`] is reported back to the
/// originating connection as an `error` event and never tears it down.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("handler not found for event type {0}")]
    HandlerNotFound(String),

    #[error("room id is missing")]
    MissingRoomId,

    #[error("{username} is already a member of room {room_id}")]
    AlreadyMember { username: String, room_id: String },

    #[error("{username} is not a member of room {room_id}")]
    NotMember { username: String, room_id: String },

    #[error("room {0} already exists, try to join the room")]
    RoomAlreadyExists(String),

    #[error("room {0} does not exist")]
    RoomNotFound(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed event: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for HubError {
    fn from(err: redis::RedisError) -> Self {
        tracing::error!(?err, "redis error");
        Self::BrokerUnavailable(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// HTTP errors
// ---------------------------------------------------------------------------

/// Structured API error returned to clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND".to_string(),
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "FORBIDDEN".to_string(),
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "CONFLICT".to_string(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "SERVICE_UNAVAILABLE".to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::RoomAlreadyExists(_) | HubError::AlreadyMember { .. } => {
                Self::conflict(err.to_string())
            }
            HubError::RoomNotFound(_) => Self::not_found(err.to_string()),
            HubError::BrokerUnavailable(_) => {
                tracing::error!(?err, "broker error");
                Self::unavailable("Backplane unavailable")
            }
            HubError::ConnectionClosed => Self::internal("An internal error occurred"),
            HubError::HandlerNotFound(_)
            | HubError::MissingRoomId
            | HubError::NotMember { .. }
            | HubError::Decode(_) => Self::bad_request(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_errors_map_to_http_status() {
        let cases = [
            (HubError::RoomAlreadyExists("R".into()), StatusCode::CONFLICT),
            (HubError::RoomNotFound("R".into()), StatusCode::NOT_FOUND),
            (HubError::MissingRoomId, StatusCode::BAD_REQUEST),
            (
                HubError::BrokerUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn handler_not_found_names_the_event() {
        let err = HubError::HandlerNotFound("typing".into());
        assert_eq!(err.to_string(), "handler not found for event type typing");
    }
}
