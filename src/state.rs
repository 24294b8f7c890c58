use std::sync::Arc;
use std::time::Instant;

use crate::executor::QueryExecutor;
use crate::rate_limit::RateLimiter;

// app's shared state
pub struct AppState {
    pub executor: QueryExecutor,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: Instant, // for uptime in /metrics
}

impl AppState {
    pub fn new(executor: QueryExecutor, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            executor,
            rate_limiter,
            started_at: Instant::now(),
        }
    }
}
