//! Query audit trail: the only place engine error detail is written down.

use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::error::ApiError;
use crate::executor::ExecutionError;
use crate::metrics::{QUERY_LATENCY, record_outcome};
use crate::models::QueryResult;

// Short stable hash of the statement text, for correlating repeats in logs
pub fn sql_fingerprint(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.trim().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

pub fn record_success(request_id: &str, sql: &str, result: &QueryResult) {
    record_outcome("success");
    QUERY_LATENCY.observe(result.elapsed.as_secs_f64());
    info!(
        request_id = %request_id,
        fingerprint = %sql_fingerprint(sql),
        sql = %sql,
        execution_time = ?result.elapsed,
        row_count = result.count,
        "Query executed successfully"
    );
}

/// Tracks one statement between dispatch and completion. Dropped without
/// [`InFlight::finish`] means the request went away mid-query (the client
/// hung up), which is recorded as a cancellation.
pub struct InFlight<'a> {
    request_id: &'a str,
    sql: &'a str,
    finished: bool,
}

impl<'a> InFlight<'a> {
    pub fn start(request_id: &'a str, sql: &'a str) -> Self {
        Self {
            request_id,
            sql,
            finished: false,
        }
    }

    pub fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        record_outcome("cancelled");
        warn!(
            request_id = %self.request_id,
            fingerprint = %sql_fingerprint(self.sql),
            "Query cancelled, client disconnected"
        );
    }
}

/// Logs one event for `err` and returns the client-safe error.
pub fn record_failure(request_id: &str, sql: &str, err: &ExecutionError) -> ApiError {
    let fingerprint = sql_fingerprint(sql);
    match err {
        ExecutionError::InvalidInput(reason) => {
            warn!(request_id = %request_id, reason = %reason, "Query rejected");
        }
        ExecutionError::Engine(detail) => {
            record_outcome(err.kind());
            error!(
                request_id = %request_id,
                fingerprint = %fingerprint,
                sql = %sql,
                error = %detail,
                "Query execution failed"
            );
        }
        ExecutionError::Timeout(limit) => {
            record_outcome(err.kind());
            warn!(
                request_id = %request_id,
                fingerprint = %fingerprint,
                sql = %sql,
                timeout = ?limit,
                "Query timed out"
            );
        }
        ExecutionError::Cancelled => {
            record_outcome(err.kind());
            warn!(request_id = %request_id, fingerprint = %fingerprint, "Query cancelled");
        }
        ExecutionError::Unavailable(detail) | ExecutionError::Processing(detail) => {
            record_outcome(err.kind());
            error!(
                request_id = %request_id,
                fingerprint = %fingerprint,
                sql = %sql,
                kind = err.kind(),
                error = %detail,
                "Query failed"
            );
        }
    }
    ApiError::from(err)
}
