use axum::{Json, extract::State, http::header, response::IntoResponse};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;

use crate::error::ApiError;
use crate::metrics::{RATE_LIMITED_TOTAL, REQUEST_TOTAL, outcome_count, process_memory};
use crate::models::{MemoryStats, MetricsResponse, QueryStats, format_duration};
use crate::state::AppState;

// GET /metrics - JSON snapshot of the process
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    let (resident_bytes, virtual_bytes) = process_memory();

    Json(MetricsResponse {
        uptime: format_duration(state.started_at.elapsed()),
        tasks: tokio::runtime::Handle::current().metrics().num_alive_tasks(),
        memory: MemoryStats {
            resident_bytes,
            virtual_bytes,
        },
        database: state.executor.database().stats(),
        queries: QueryStats {
            total_requests: REQUEST_TOTAL.get(),
            rate_limited: RATE_LIMITED_TOTAL.get(),
            succeeded: outcome_count("success"),
            engine_errors: outcome_count("engine_error"),
            timeouts: outcome_count("timeout"),
            cancelled: outcome_count("cancelled"),
            unavailable: outcome_count("unavailable"),
            processing_errors: outcome_count("processing_error"),
            tracked_clients: state.rate_limiter.tracked_clients(),
        },
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

// GET /metrics/prometheus - text exposition of the registered metrics
pub async fn prometheus_handler() -> Result<impl IntoResponse, ApiError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| ApiError::Internal)?;
    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer))
}
