//! DuckDB handle: a bounded r2d2 pool over one database.

use duckdb::{AccessMode, DuckdbConnectionManager};
use parking_lot::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::models::PoolStats;

pub type Pool = r2d2::Pool<DuckdbConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<DuckdbConnectionManager>;

const CONNECTION_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("failed to open database: {0}")]
    Open(#[from] duckdb::Error),

    #[error("failed to build connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("failed to ping database: {0}")]
    Ping(String),

    #[error("database handle is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    // None opens an in-memory database
    pub path: Option<String>,
    pub max_connections: u32,
    pub read_write: bool,
    // how long a caller may wait for a free connection
    pub acquire_timeout: Duration,
}

impl DatabaseOptions {
    pub fn in_memory(max_connections: u32) -> Self {
        Self {
            path: None,
            max_connections,
            read_write: true,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Database {
    pool: RwLock<Option<Pool>>,
    max_connections: u32,
}

impl Database {
    /// Opens the database and verifies it answers a trivial statement.
    /// Blocks while the pool fills its idle connections.
    pub fn open(options: &DatabaseOptions) -> Result<Self, DatabaseError> {
        let manager = match &options.path {
            Some(path) => {
                let access_mode = if options.read_write {
                    AccessMode::ReadWrite
                } else {
                    AccessMode::ReadOnly
                };
                let flags = duckdb::Config::default().access_mode(access_mode)?;
                DuckdbConnectionManager::file_with_flags(path, flags)?
            }
            None => DuckdbConnectionManager::memory()?,
        };

        let max = options.max_connections.max(1);
        let pool = r2d2::Pool::builder()
            .max_size(max)
            .min_idle(Some((max / 2).max(1)))
            .max_lifetime(Some(CONNECTION_MAX_LIFETIME))
            .connection_timeout(options.acquire_timeout)
            .build(manager)?;

        let database = Self {
            pool: RwLock::new(Some(pool)),
            max_connections: max,
        };
        database.ping_blocking(options.acquire_timeout)?;

        info!(
            database_path = options.path.as_deref().unwrap_or(":memory:"),
            max_connections = max,
            read_write = options.read_write,
            "Database connection established"
        );
        Ok(database)
    }

    /// Checks a connection out of the pool, waiting at most `timeout`.
    pub fn connection(&self, timeout: Duration) -> Result<PooledConnection, DatabaseError> {
        // clone the pool handle so the lock is not held while waiting
        let pool = self.pool.read().clone().ok_or(DatabaseError::Closed)?;
        Ok(pool.get_timeout(timeout)?)
    }

    /// Runs `SELECT 1` on a pooled connection. Blocking.
    pub fn ping_blocking(&self, timeout: Duration) -> Result<(), DatabaseError> {
        let conn = self.connection(timeout)?;
        conn.execute_batch("SELECT 1")
            .map_err(|e| DatabaseError::Ping(e.to_string()))
    }

    pub fn stats(&self) -> PoolStats {
        let Some(pool) = self.pool.read().clone() else {
            return PoolStats {
                max_open_connections: self.max_connections,
                ..PoolStats::default()
            };
        };
        let state = pool.state();
        PoolStats {
            max_open_connections: pool.max_size(),
            open_connections: state.connections,
            in_use: state.connections.saturating_sub(state.idle_connections),
            idle: state.idle_connections,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pool.read().is_none()
    }

    /// Drops the pool. Connections still checked out close once returned;
    /// every later checkout fails with [`DatabaseError::Closed`].
    pub fn close(&self) {
        if self.pool.write().take().is_some() {
            info!("Database handle closed");
        }
    }
}
