//! HTTP-facing error taxonomy.
//!
//! Each variant maps to one status code and one client-safe message. Detail
//! that must not reach clients (engine messages, schema names, paths) is
//! logged by the caller before the error is converted into a response.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::executor::ExecutionError;
use crate::models::ErrorEnvelope;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Empty or oversized SQL, malformed body. The message is safe to expose.
    #[error("{0}")]
    ClientInput(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    /// The engine rejected the statement, or it timed out / was cancelled.
    #[error("Query execution failed")]
    Execution,

    /// Failure while turning engine rows into a result.
    #[error("Failed to process query results")]
    Processing,

    #[error("Database not available")]
    Unavailable,

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::ClientInput(_) | ApiError::Execution => StatusCode::BAD_REQUEST,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Processing | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<&ExecutionError> for ApiError {
    fn from(err: &ExecutionError) -> Self {
        match err {
            ExecutionError::InvalidInput(message) => ApiError::ClientInput(message.clone()),
            ExecutionError::Engine(_)
            | ExecutionError::Timeout(_)
            | ExecutionError::Cancelled
            | ExecutionError::Unavailable(_) => ApiError::Execution,
            ExecutionError::Processing(_) => ApiError::Processing,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorEnvelope::new(self.to_string()))).into_response()
    }
}
