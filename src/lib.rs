pub mod audit;
pub mod config;
pub mod database;
pub mod encoder;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod server;
pub mod state;
