use serde::{Deserialize, Serialize};
use std::time::Duration;

// POST /query request body
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueryRequest {
    pub sql: String,
}

/// A single encoded cell. The engine hands back loosely typed scalars; at
/// the wire boundary every value is one of these four shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Boolean(bool),
    Number(serde_json::Number),
    Text(String),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        CellValue::Text(value.into())
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Number(value.into())
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Boolean(value)
    }
}

/// Column-oriented result of one successful execution.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    pub count: usize,
    pub elapsed: Duration,
}

// POST /query success body
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueryResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    pub count: usize,
    pub execution_time: String,
}

impl From<QueryResult> for QueryResponse {
    fn from(result: QueryResult) -> Self {
        Self {
            columns: result.columns,
            rows: result.rows,
            count: result.count,
            execution_time: format_duration(result.elapsed),
        }
    }
}

// Error envelope returned on every failure path
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorEnvelope {
    pub error: String,
    pub timestamp: String,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MetricsResponse {
    pub uptime: String,
    pub tasks: usize,
    pub memory: MemoryStats,
    pub database: PoolStats,
    pub queries: QueryStats,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MemoryStats {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_open_connections: u32,
    pub open_connections: u32,
    pub in_use: u32,
    pub idle: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct QueryStats {
    pub total_requests: u64,
    pub rate_limited: u64,
    pub succeeded: u64,
    pub engine_errors: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub unavailable: u64,
    pub processing_errors: u64,
    pub tracked_clients: usize,
}

/// Renders a duration the way the wire format expects, e.g. `1.5ms`,
/// `2.000431s`.
pub fn format_duration(duration: Duration) -> String {
    format!("{duration:?}")
}
