use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use duck_gateway::config::{Args, Config, SHUTDOWN_GRACE};
use duck_gateway::database::{Database, DatabaseOptions};
use duck_gateway::executor::QueryExecutor;
use duck_gateway::rate_limit::{RateLimitConfig, RateLimiter, run_sweeper};
use duck_gateway::server;
use duck_gateway::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = match args.validate() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    info!(
        port = config.port,
        query_timeout = ?config.query_timeout,
        max_connections = config.max_connections,
        read_write = config.read_write,
        "Starting duck gateway"
    );

    let db = open_database(&config).await?;
    let executor = QueryExecutor::new(db.clone(), config.query_timeout);
    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
    let state = Arc::new(AppState::new(executor, rate_limiter.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let sweeper = tokio::spawn(run_sweeper(rate_limiter, shutdown_rx.clone()));

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(addr = %listener.local_addr()?, "Server listening");

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        info!("Shutdown signal received");
        signal_tx.send_replace(true);
    });

    let served = server::run(listener, state, shutdown_rx, SHUTDOWN_GRACE).await;

    // the server may also stop on its own error, make sure the sweeper follows
    shutdown_tx.send_replace(true);
    let _ = sweeper.await;
    db.close();
    info!("Database closed");

    served?;
    Ok(())
}

// JSON logs to stdout, level from config with RUST_LOG taking precedence
fn init_tracing(level: &str) {
    let parsed = level.trim().parse::<tracing::Level>().ok();
    let default_level = parsed.unwrap_or(tracing::Level::INFO);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_ascii_lowercase()));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if parsed.is_none() {
        warn!(log_level = level, "Unknown log level, falling back to info");
    }
}

async fn open_database(config: &Config) -> Result<Arc<Database>, Box<dyn std::error::Error>> {
    let options = DatabaseOptions {
        path: config.database_path.clone(),
        max_connections: config.max_connections,
        read_write: config.read_write,
        acquire_timeout: config.query_timeout,
    };

    // opening fills the pool, keep it off the runtime threads
    let opened = tokio::task::spawn_blocking(move || Database::open(&options)).await?;
    match opened {
        Ok(db) => Ok(Arc::new(db)),
        Err(e) => {
            error!(error = %e, "Failed to open database");
            Err(e.into())
        }
    }
}
