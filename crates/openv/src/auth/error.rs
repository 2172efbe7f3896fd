//! Authentication errors.

use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::api::ApiError;

#[derive(Debug, Error)]
pub enum AuthError {
    /// No token in the header, cookie or query string.
    #[error("missing authorization header")]
    MissingAuthHeader,

    #[error("invalid authorization header format")]
    InvalidAuthHeader,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    TokenExpired,

    /// The token's subject is not a tenant id.
    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    #[error("internal auth error: {0}")]
    Internal(String),
}

/// Rejections share the API error body, `{error, code, details?}`.
impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
