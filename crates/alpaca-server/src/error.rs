//! HTTP error handling and response mapping.
//!
//! Clients only ever see a short generic message; the detail goes to the log.

use alpaca_engine::ValidationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::models::MessageBody;
use crate::session::SessionError;

/// Non-standard "client closed request" status.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<ValidationError> for ServerError {
    fn from(e: ValidationError) -> Self {
        ServerError::Session(SessionError::Validation(e))
    }
}

impl ServerError {
    /// Status code and public message for this error.
    pub fn status_and_message(&self) -> (StatusCode, &'static str) {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Session(SessionError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "invalid request")
            }
            ServerError::Session(SessionError::QueueFull) => {
                (StatusCode::SERVICE_UNAVAILABLE, "busy")
            }
            ServerError::Session(SessionError::TimedOut) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            ServerError::Session(SessionError::Cancelled) => (
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST),
                "cancelled",
            ),
            ServerError::Session(
                SessionError::Generation(_)
                | SessionError::WorkerUnavailable
                | SessionError::AlreadySubmitted
                | SessionError::NotSubmitted,
            ) => (StatusCode::INTERNAL_SERVER_ERROR, "error"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(MessageBody::new(message))).into_response()
    }
}
