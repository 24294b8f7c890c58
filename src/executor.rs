//! Timeout-bounded execution of a single SQL statement.
//!
//! The statement runs on the blocking pool. The async side races it against
//! the deadline and an optional cancellation future; whichever finishes
//! first decides the outcome. Losing the race interrupts the engine through
//! DuckDB's interrupt handle so the connection goes back to the pool instead
//! of running the abandoned statement to completion. Dropping the returned
//! future (a client that hung up) interrupts the statement as well.

use parking_lot::Mutex;
use std::future::{Future, pending};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::MAX_SQL_BYTES;
use crate::database::Database;
use crate::encoder;
use crate::models::QueryResult;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Rejected before reaching the engine.
    #[error("{0}")]
    InvalidInput(String),

    /// The engine refused the statement. Holds the engine's own message,
    /// which is for logs only.
    #[error("engine error: {0}")]
    Engine(String),

    #[error("query exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("query cancelled by client")]
    Cancelled,

    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("failed to process query results: {0}")]
    Processing(String),
}

impl ExecutionError {
    /// Metric label for this outcome.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::InvalidInput(_) => "invalid_input",
            ExecutionError::Engine(_) => "engine_error",
            ExecutionError::Timeout(_) => "timeout",
            ExecutionError::Cancelled => "cancelled",
            ExecutionError::Unavailable(_) => "unavailable",
            ExecutionError::Processing(_) => "processing_error",
        }
    }
}

/// Checks the statement text before any engine call.
pub fn validate_sql(sql: &str) -> Result<&str, ExecutionError> {
    if sql.trim().is_empty() {
        return Err(ExecutionError::InvalidInput(
            "SQL query cannot be empty".to_string(),
        ));
    }
    if sql.len() > MAX_SQL_BYTES {
        return Err(ExecutionError::InvalidInput(
            "SQL query too large (max 10KB)".to_string(),
        ));
    }
    Ok(sql)
}

type InterruptFn = Box<dyn Fn() + Send>;

#[derive(Default)]
struct InterruptState {
    fired: bool,
    interrupt: Option<InterruptFn>,
}

/// Hand-off point between the async side and the thread running the query.
/// The worker arms it once it holds a connection and disarms it before the
/// connection returns to the pool, so a late interrupt never hits a
/// statement that belongs to somebody else.
#[derive(Default)]
pub(crate) struct Interrupter {
    state: Mutex<InterruptState>,
}

impl Interrupter {
    /// Returns `false` if the query was abandoned before it started.
    fn arm(&self, interrupt: InterruptFn) -> bool {
        let mut state = self.state.lock();
        if state.fired {
            return false;
        }
        state.interrupt = Some(interrupt);
        true
    }

    fn disarm(&self) {
        self.state.lock().interrupt = None;
    }

    fn fire(&self) {
        let mut state = self.state.lock();
        state.fired = true;
        if let Some(interrupt) = state.interrupt.take() {
            interrupt();
        }
    }
}

// Fires the interrupter when the owning request future is dropped
struct InterruptOnDrop(Arc<Interrupter>);

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        self.0.fire();
    }
}

#[derive(Clone)]
pub struct QueryExecutor {
    db: Arc<Database>,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(db: Arc<Database>, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Runs `sql` under the configured timeout.
    pub async fn execute(&self, sql: &str) -> Result<QueryResult, ExecutionError> {
        self.execute_with_cancel(sql, self.timeout, pending()).await
    }

    /// Runs `sql`, giving up when `timeout` elapses or `cancel` completes.
    pub async fn execute_with_cancel<F>(
        &self,
        sql: &str,
        timeout: Duration,
        cancel: F,
    ) -> Result<QueryResult, ExecutionError>
    where
        F: Future<Output = ()>,
    {
        let sql = validate_sql(sql)?.to_string();
        let deadline = Instant::now() + timeout;

        let interrupter = Arc::new(Interrupter::default());
        let _guard = InterruptOnDrop(interrupter.clone());

        let db = self.db.clone();
        let worker = interrupter.clone();
        let task = tokio::task::spawn_blocking(move || {
            run_statement(&db, &sql, deadline.into_std(), &worker)
        });

        tokio::pin!(cancel);
        tokio::select! {
            joined = task => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => Err(ExecutionError::Processing(format!("query task failed: {e}"))),
            },
            _ = tokio::time::sleep_until(deadline) => {
                interrupter.fire();
                Err(ExecutionError::Timeout(timeout))
            }
            _ = &mut cancel => {
                interrupter.fire();
                Err(ExecutionError::Cancelled)
            }
        }
    }

    /// Liveness check that runs no user SQL.
    pub async fn ping(&self, timeout: Duration) -> Result<(), ExecutionError> {
        let db = self.db.clone();
        let task = tokio::task::spawn_blocking(move || db.ping_blocking(timeout));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ExecutionError::Unavailable(e.to_string())),
            Ok(Err(e)) => Err(ExecutionError::Unavailable(format!("ping task failed: {e}"))),
            Err(_) => Err(ExecutionError::Timeout(timeout)),
        }
    }
}

// Runs on the blocking pool
fn run_statement(
    db: &Database,
    sql: &str,
    deadline: std::time::Instant,
    interrupter: &Interrupter,
) -> Result<QueryResult, ExecutionError> {
    let wait = deadline.saturating_duration_since(std::time::Instant::now());
    let conn = db
        .connection(wait)
        .map_err(|e| ExecutionError::Unavailable(e.to_string()))?;

    let handle = conn.interrupt_handle();
    if !interrupter.arm(Box::new(move || handle.interrupt())) {
        return Err(ExecutionError::Cancelled);
    }
    let result = fetch(&conn, sql);
    interrupter.disarm();
    result
}

fn fetch(conn: &duckdb::Connection, sql: &str) -> Result<QueryResult, ExecutionError> {
    let engine = |e: duckdb::Error| ExecutionError::Engine(e.to_string());

    let started = std::time::Instant::now();
    let mut stmt = conn.prepare(sql).map_err(engine)?;
    let rows = stmt.query([]).map_err(engine)?;
    let bit_columns = rows.as_ref().map(encoder::bit_columns).unwrap_or_default();
    // a failure while pulling chunks is still the engine's
    let rows = encoder::encode_rows(rows.mapped(|row| Ok(encoder::encode_row(row, &bit_columns))))
        .map_err(engine)?;
    let elapsed = started.elapsed();

    let columns = stmt.column_names();
    encoder::assemble(columns, rows, elapsed).map_err(|e| ExecutionError::Processing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseOptions;
    use crate::models::CellValue;
    use serde_json::json;
    use std::time::Duration;

    // a cross join of 10^12 rows, far longer than any test timeout
    const SLOW_SQL: &str =
        "SELECT sum(a.range * b.range) FROM range(1000000) a CROSS JOIN range(1000000) b";

    fn executor(max_connections: u32) -> QueryExecutor {
        let db = Database::open(&DatabaseOptions::in_memory(max_connections)).unwrap();
        QueryExecutor::new(Arc::new(db), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn select_one_round_trips() {
        let result = executor(2).execute("SELECT 1 AS x").await.unwrap();
        assert_eq!(result.columns, vec!["x"]);
        assert_eq!(result.rows, vec![vec![CellValue::from(1)]]);
        assert_eq!(result.count, 1);
    }

    #[tokio::test]
    async fn null_cells_are_explicit() {
        let result = executor(2)
            .execute("SELECT NULL AS a, '' AS b")
            .await
            .unwrap();
        assert_eq!(result.rows[0], vec![CellValue::Null, CellValue::text("")]);
        assert_eq!(serde_json::to_value(&result.rows).unwrap(), json!([[null, ""]]));
    }

    #[tokio::test]
    async fn mixed_types_keep_their_shape() {
        let result = executor(2)
            .execute(
                "SELECT 42::BIGINT AS n, 2.5::DOUBLE AS d, true AS b, 'hi' AS s, \
                 'abc'::BLOB AS ok_blob, '\\xFF\\x00'::BLOB AS raw_blob, 12.50::DECIMAL(4,2) AS dec",
            )
            .await
            .unwrap();
        assert_eq!(
            result.columns,
            vec!["n", "d", "b", "s", "ok_blob", "raw_blob", "dec"]
        );
        assert_eq!(
            serde_json::to_value(&result.rows[0]).unwrap(),
            json!([42, 2.5, true, "hi", "abc", "base64:/wA=", 12.5])
        );
    }

    #[tokio::test]
    async fn structured_types_render_as_text() {
        let result = executor(2)
            .execute(
                "SELECT 'x'::VARCHAR::ENUM('x', 'y') AS e, [1, 2] AS l, {'a': 1} AS s, \
                 MAP {'k': 1} AS m, INTERVAL 1 DAY AS i, '1010'::BIT AS b",
            )
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(&result.rows[0]).unwrap(),
            json!(["x", "[1, 2]", "{'a': 1}", "{'k'=1}", "1 day", "1010"])
        );
    }

    #[tokio::test]
    async fn wide_decimals_keep_every_digit() {
        let result = executor(2)
            .execute(
                "SELECT 12345678901234567890123456789012345678::DECIMAL(38,0) AS whole, \
                 123456789012345678.12345678901234567890::DECIMAL(38,20) AS frac, \
                 0.25::DECIMAL(38,20) AS exact",
            )
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(&result.rows[0]).unwrap(),
            json!([
                "12345678901234567890123456789012345678",
                "123456789012345678.12345678901234567890",
                0.25
            ])
        );
    }

    #[tokio::test]
    async fn rows_keep_engine_order() {
        let result = executor(2)
            .execute("SELECT range AS i FROM range(5) ORDER BY i")
            .await
            .unwrap();
        assert_eq!(result.count, 5);
        assert_eq!(result.rows.len(), 5);
        assert_eq!(result.rows[4], vec![CellValue::from(4)]);
    }

    #[tokio::test]
    async fn empty_result_keeps_columns() {
        let result = executor(2)
            .execute("SELECT 1 AS x WHERE false")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["x"]);
        assert_eq!(result.count, 0);
    }

    #[tokio::test]
    async fn rejects_bad_input_before_the_engine() {
        let executor = executor(1);
        // a closed database would answer Unavailable if the engine were reached
        executor.database().close();

        for sql in ["", "   \n\t "] {
            let err = executor.execute(sql).await.unwrap_err();
            assert!(matches!(err, ExecutionError::InvalidInput(ref m) if m == "SQL query cannot be empty"));
        }

        let oversized = format!("SELECT 1{}", " ".repeat(MAX_SQL_BYTES));
        let err = executor.execute(&oversized).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidInput(ref m) if m.contains("too large")));
    }

    #[test]
    fn accepts_sql_at_the_size_ceiling() {
        let sql = format!("SELECT 1{}", " ".repeat(MAX_SQL_BYTES - 8));
        assert_eq!(sql.len(), MAX_SQL_BYTES);
        assert!(validate_sql(&sql).is_ok());
    }

    #[tokio::test]
    async fn engine_errors_are_classified() {
        let err = executor(1).execute("SELEC 1").await.unwrap_err();
        assert!(matches!(err, ExecutionError::Engine(_)));
        assert_eq!(err.kind(), "engine_error");

        let err = executor(1)
            .execute("SELECT * FROM no_such_table")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Engine(ref m) if m.contains("no_such_table")));
    }

    #[tokio::test]
    async fn error_raised_while_streaming_rows_is_an_engine_error() {
        let err = executor(1)
            .execute(
                "SELECT CASE WHEN range = 99999 THEN error('boom') ELSE range END AS v \
                 FROM range(100000)",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Engine(ref m) if m.contains("boom")));
        assert_eq!(err.kind(), "engine_error");
    }

    #[tokio::test]
    async fn slow_query_times_out_and_frees_its_connection() {
        let executor = executor(1);
        let started = std::time::Instant::now();
        let err = executor
            .execute_with_cancel(SLOW_SQL, Duration::from_millis(200), pending())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));

        // the single pooled connection only comes back if the interrupt landed
        let result = executor.execute("SELECT 1 AS x").await.unwrap();
        assert_eq!(result.count, 1);
    }

    #[tokio::test]
    async fn cancellation_wins_over_the_deadline() {
        let executor = executor(1);
        let err = executor
            .execute_with_cancel(
                SLOW_SQL,
                Duration::from_secs(30),
                tokio::time::sleep(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
        assert_eq!(err.kind(), "cancelled");

        assert!(executor.execute("SELECT 1").await.is_ok());
    }

    #[tokio::test]
    async fn dropping_the_request_interrupts_the_query() {
        let executor = executor(1);
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), executor.execute(SLOW_SQL)).await;
        assert!(abandoned.is_err());

        assert!(executor.execute("SELECT 1").await.is_ok());
    }

    #[tokio::test]
    async fn writes_to_scratch_table_succeed() {
        let executor = executor(3);
        executor
            .execute("CREATE TABLE scratch (id INTEGER, name VARCHAR)")
            .await
            .unwrap();
        executor
            .execute("INSERT INTO scratch VALUES (1, 'a'), (2, NULL)")
            .await
            .unwrap();
        let result = executor
            .execute("SELECT id, name FROM scratch ORDER BY id")
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(&result.rows).unwrap(),
            json!([[1, "a"], [2, null]])
        );
    }

    #[tokio::test]
    async fn ping_reports_liveness() {
        let executor = executor(1);
        assert!(executor.ping(Duration::from_secs(5)).await.is_ok());

        executor.database().close();
        let err = executor.ping(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Unavailable(_)));
    }

    #[test]
    fn interrupter_fires_once_armed() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let interrupter = Interrupter::default();
        let counter = hits.clone();
        assert!(interrupter.arm(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        interrupter.fire();
        interrupter.fire();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // too late to start
        assert!(!interrupter.arm(Box::new(|| {})));
    }

    #[test]
    fn disarmed_interrupter_does_nothing() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let interrupter = Interrupter::default();
        let counter = hits.clone();
        interrupter.arm(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        interrupter.disarm();
        interrupter.fire();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
