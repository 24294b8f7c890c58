use clap::Parser;
use std::time::Duration;
use thiserror::Error;

// Fixed admission policy: 60 requests per minute per client
pub const RATE_LIMIT_REQUESTS: u32 = 60;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub const MAX_SQL_BYTES: usize = 10_240;
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const MIN_QUERY_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_QUERY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

// CLI argument structure, every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "duck-gateway")]
#[command(about = "SQL over HTTP gateway for an embedded DuckDB database")]
pub struct Args {
    // Database file, empty means in-memory
    #[arg(long, env = "DUCK_GATEWAY_DATABASE_PATH", default_value = "")]
    pub database_path: String,

    // Port to run the server on
    #[arg(short, long, env = "DUCK_GATEWAY_PORT", default_value_t = 8080)]
    pub port: u16,

    // Query timeout, e.g. "30s", "1m30s", "500ms"
    #[arg(long, env = "DUCK_GATEWAY_QUERY_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub query_timeout: Duration,

    // Connection pool size
    #[arg(long, env = "DUCK_GATEWAY_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: u32,

    // error, warn, info, debug or trace
    #[arg(long, env = "DUCK_GATEWAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    // Open the database for writing
    #[arg(long, env = "DUCK_GATEWAY_READ_WRITE", default_value_t = false, action = clap::ArgAction::Set)]
    pub read_write: bool,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: Option<String>,
    pub port: u16,
    pub query_timeout: Duration,
    pub max_connections: u32,
    pub log_level: String,
    pub read_write: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MAX_CONNECTIONS must be between 1 and 100, got {0}")]
    MaxConnections(u32),

    #[error("QUERY_TIMEOUT must be between 1s and 10m, got {0:?}")]
    QueryTimeout(Duration),

    #[error("in-memory database requires READ_WRITE=true")]
    InMemoryReadOnly,
}

impl Args {
    pub fn validate(self) -> Result<Config, ConfigError> {
        if !(1..=100).contains(&self.max_connections) {
            return Err(ConfigError::MaxConnections(self.max_connections));
        }

        if self.query_timeout < MIN_QUERY_TIMEOUT || self.query_timeout > MAX_QUERY_TIMEOUT {
            return Err(ConfigError::QueryTimeout(self.query_timeout));
        }

        let database_path = Some(self.database_path.trim().to_string()).filter(|p| !p.is_empty());

        // an in-memory database opened read-only could never hold any data
        if database_path.is_none() && !self.read_write {
            return Err(ConfigError::InMemoryReadOnly);
        }

        Ok(Config {
            database_path,
            port: self.port,
            query_timeout: self.query_timeout,
            max_connections: self.max_connections,
            log_level: self.log_level,
            read_write: self.read_write,
        })
    }
}

/// Parses Go-style duration text such as `30s`, `1m30s`, `1.5h` or `250ms`.
/// Like Go, every number needs a unit except a lone `0`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let text = input.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }
    if text == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("missing unit in duration {input:?}")),
            unit => return Err(format!("unknown unit {unit:?} in duration {input:?}")),
        };
        rest = &rest[unit_len..];
        total += value * scale;
    }

    Duration::try_from_secs_f64(total).map_err(|e| format!("invalid duration {input:?}: {e}"))
}
