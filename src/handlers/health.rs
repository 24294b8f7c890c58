use axum::{Json, extract::State};
use std::sync::Arc;
use tracing::error;

use crate::config::HEALTH_TIMEOUT;
use crate::error::ApiError;
use crate::models::HealthResponse;
use crate::state::AppState;

// GET /health - healthy only if the engine answers a ping in time
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, ApiError> {
    match state.executor.ping(HEALTH_TIMEOUT).await {
        Ok(()) => Ok(Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        })),
        Err(err) => {
            error!(error = %err, "Health check failed");
            Err(ApiError::Unavailable)
        }
    }
}
