//! Error types surfaced on the HTTP boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors returned by registry lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session id is unknown, or the session has already ended.
    #[error("Session not found or expired")]
    NotFound,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        match self {
            SessionError::NotFound => (StatusCode::NOT_FOUND, self.to_string()).into_response(),
        }
    }
}
