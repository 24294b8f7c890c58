mod health;
mod metrics;
mod query;

pub use health::health_handler;
pub use metrics::{metrics_handler, prometheus_handler};
pub use query::query_handler;
