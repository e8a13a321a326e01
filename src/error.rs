//! Typed errors surfaced by the conversation service.
//!
//! Validation and authorization failures abort the operation that raised them
//! and map 1:1 to HTTP statuses. Delivery failures never appear here — they
//! are confined to the notification dispatcher.

use crate::models::ErrorResponse;
use axum::{http::StatusCode, response::IntoResponse, Json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid participant set: {0}")]
    InvalidParticipants(String),

    #[error("not a participant of this conversation")]
    NotAuthorized,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("message body cannot be empty")]
    EmptyMessage,

    #[error("device token cannot be empty")]
    InvalidToken,

    #[error("missing or invalid authentication token")]
    Unauthenticated,

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::InvalidParticipants(_)
            | ChatError::EmptyMessage
            | ChatError::InvalidToken => StatusCode::BAD_REQUEST,
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::NotAuthorized => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error: {self:#}");
        }
        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
        });
        (status, body).into_response()
    }
}
