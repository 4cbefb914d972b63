//! # Errors
//!
//! Nothing in the relay reports an error back to the participant that caused
//! it. [`RelayError`] exists so that every dropped frame, refused handshake or
//! failed write is classified and logged consistently. [`ApiError`] is the
//! only error that reaches a client, through the HTTP side endpoints.

use crate::state::ConnectionId;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("handshake rejected: {0}")]
    HandshakeRejected(&'static str),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),

    #[error("delivery to connection {connection_id} failed")]
    DeliveryFailure { connection_id: ConnectionId },

    #[error("screenshot not persisted: {0}")]
    Persistence(#[from] ScreenshotError),
}

#[derive(Debug, Error)]
pub enum ScreenshotError {
    #[error("invalid path component `{0}`")]
    InvalidComponent(String),

    #[error("screenshot for interview `{payload}` sent from room `{room}`")]
    RoomMismatch { room: String, payload: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ScreenshotError> for ApiError {
    fn from(err: ScreenshotError) -> Self {
        match err {
            ScreenshotError::InvalidComponent(_) | ScreenshotError::RoomMismatch { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            ScreenshotError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ApiError::NotFound,
            ScreenshotError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}
