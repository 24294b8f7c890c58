use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
};
use std::sync::Arc;
use tracing::warn;

use crate::audit::{InFlight, record_failure, record_success};
use crate::error::ApiError;
use crate::metrics::REQUEST_TOTAL;
use crate::middleware::RequestId;
use crate::models::{QueryRequest, QueryResponse};
use crate::state::AppState;

// POST /query
pub async fn query_handler(
    State(state): State<Arc<AppState>>,
    request_id: Option<Extension<RequestId>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    REQUEST_TOTAL.inc();
    let request_id = request_id
        .map(|Extension(RequestId(id))| id)
        .unwrap_or_default();

    // malformed JSON, missing "sql" or wrong content type all land here
    let Json(request) = payload.map_err(|rejection| {
        warn!(request_id = %request_id, reason = %rejection.body_text(), "Invalid request body");
        ApiError::ClientInput(format!("Invalid request: {}", rejection.body_text()))
    })?;

    let in_flight = InFlight::start(&request_id, &request.sql);
    let outcome = state.executor.execute(&request.sql).await;
    in_flight.finish();

    match outcome {
        Ok(result) => {
            record_success(&request_id, &request.sql, &result);
            Ok(Json(QueryResponse::from(result)))
        }
        Err(err) => Err(record_failure(&request_id, &request.sql, &err)),
    }
}
