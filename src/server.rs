use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::handlers::{health_handler, metrics_handler, prometheus_handler, query_handler};
use crate::middleware::{
    cors_middleware, logging_middleware, recovery_middleware, request_id_middleware,
};
use crate::rate_limit::rate_limit_middleware;
use crate::state::AppState;

/// Routes plus middleware. Layers run outside-in: request id, panic
/// recovery, access log, CORS, rate limit, handler.
pub fn build_router(state: Arc<AppState>) -> Router {
    crate::metrics::init();
    let limiter = state.rate_limiter.clone();

    Router::new()
        .route("/query", post(query_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/prometheus", get(prometheus_handler))
        .with_state(state)
        .layer(from_fn_with_state(limiter, rate_limit_middleware))
        .layer(from_fn(cors_middleware))
        .layer(from_fn(logging_middleware))
        .layer(from_fn(recovery_middleware))
        .layer(from_fn(request_id_middleware))
}

/// Serves until `shutdown` flips to `true`, then drains in-flight requests
/// for at most `grace` before giving up on them.
pub async fn run(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
) -> std::io::Result<()> {
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(wait_for(shutdown.clone()))
        .into_future();

    tokio::select! {
        result = server => {
            info!("Server shutdown complete");
            result
        }
        _ = async {
            wait_for(shutdown).await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace = ?grace, "Server forced to shutdown with requests in flight");
            Ok(())
        }
    }
}

// Resolves once the flag is set or the sender is gone
pub async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, DatabaseOptions};
    use crate::executor::QueryExecutor;
    use crate::rate_limit::{RateLimitConfig, RateLimiter};
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let db = Database::open(&DatabaseOptions::in_memory(2)).unwrap();
        let executor = QueryExecutor::new(Arc::new(db), Duration::from_secs(5));
        // long holds so slow machines cannot free a slot mid-test
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            window: Duration::from_secs(3600),
            ..RateLimitConfig::default()
        }));
        Arc::new(AppState::new(executor, limiter))
    }

    fn query(body: impl Into<String>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/query")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.into()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn query_returns_columns_rows_and_count() {
        let app = build_router(test_state());
        let (status, body) = send(&app, query(r#"{"sql":"SELECT 1 AS x, 'a' AS y"}"#)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["columns"], json!(["x", "y"]));
        assert_eq!(body["rows"], json!([[1, "a"]]));
        assert_eq!(body["count"], json!(1));
        assert!(body["execution_time"].as_str().is_some_and(|t| !t.is_empty()));
    }

    #[tokio::test]
    async fn blank_sql_is_rejected() {
        let app = build_router(test_state());
        for sql in ["", "   \n\t"] {
            let (status, body) = send(&app, query(json!({ "sql": sql }).to_string())).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], "SQL query cannot be empty");
            assert!(body["timestamp"].is_string());
        }
    }

    #[tokio::test]
    async fn oversized_sql_is_rejected() {
        let app = build_router(test_state());
        let sql = format!("SELECT '{}'", "x".repeat(crate::config::MAX_SQL_BYTES));
        let (status, body) = send(&app, query(json!({ "sql": sql }).to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "SQL query too large (max 10KB)");
    }

    #[tokio::test]
    async fn malformed_bodies_are_client_errors() {
        let app = build_router(test_state());
        for body in ["{not json", r#"{"query":"SELECT 1"}"#, r#"{"sql":42}"#] {
            let (status, envelope) = send(&app, query(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {body}");
            assert!(
                envelope["error"]
                    .as_str()
                    .is_some_and(|e| e.starts_with("Invalid request: "))
            );
        }
    }

    #[tokio::test]
    async fn engine_errors_stay_generic() {
        let app = build_router(test_state());
        let (status, body) = send(&app, query(r#"{"sql":"SELECT * FROM secret_table"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Query execution failed");
        assert!(!body.to_string().contains("secret_table"));
    }

    #[tokio::test]
    async fn client_disconnect_mid_query_is_counted_as_cancelled() {
        let app = build_router(test_state());
        let before = crate::metrics::outcome_count("cancelled");

        let slow = query(
            json!({
                "sql": "SELECT sum(a.range * b.range) FROM range(1000000) a CROSS JOIN range(1000000) b"
            })
            .to_string(),
        );
        let in_flight = tokio::spawn(app.clone().oneshot(slow));
        tokio::time::sleep(Duration::from_millis(300)).await;
        in_flight.abort();
        assert!(in_flight.await.unwrap_err().is_cancelled());

        assert!(crate::metrics::outcome_count("cancelled") > before);
        let (status, _) = send(&app, query(r#"{"sql":"SELECT 1"}"#)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reflects_database_state() {
        let state = test_state();
        let app = build_router(state.clone());

        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        state.executor.database().close();
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Database not available");
    }

    #[tokio::test]
    async fn metrics_snapshot_has_pool_and_query_stats() {
        let app = build_router(test_state());
        send(&app, query(r#"{"sql":"SELECT 1"}"#)).await;

        let (status, body) = send(&app, get("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"]["max_open_connections"], json!(2));
        assert!(body["queries"]["total_requests"].as_u64().unwrap() >= 1);
        assert!(body["uptime"].is_string());
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn prometheus_exposition_lists_gateway_metrics() {
        let app = build_router(test_state());
        let response = app.oneshot(get("/metrics/prometheus")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("gateway_query_outcomes_total"));
    }

    #[tokio::test]
    async fn sixty_first_request_in_a_minute_is_throttled() {
        let app = build_router(test_state());
        for _ in 0..60 {
            let (status, _) = send(&app, get("/health")).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Rate limit exceeded");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn preflight_is_answered_with_cors_headers() {
        let app = build_router(test_state());
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/query")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "GET, POST, OPTIONS");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");
    }

    #[tokio::test]
    async fn request_id_is_echoed_or_generated() {
        let app = build_router(test_state());

        let request = Request::builder()
            .uri("/health")
            .header("x-request-id", "abc-123")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.headers()["x-request-id"], "abc-123");

        let response = app.oneshot(get("/health")).await.unwrap();
        let generated = response.headers()["x-request-id"].to_str().unwrap();
        assert_eq!(generated.len(), 36);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let app = build_router(test_state());
        let response = app.oneshot(get("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn run_stops_when_shutdown_is_signalled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(run(listener, test_state(), rx, Duration::from_secs(1)));

        tx.send_replace(true);
        let result = tokio::time::timeout(Duration::from_secs(5), server).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
