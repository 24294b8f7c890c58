//! Per-client token-bucket admission control.
//!
//! Every client identity owns a bucket of `capacity` slots. An admitted
//! request takes a slot that is handed back `hold` later, where
//! `hold = window / capacity`. This approximates a sliding window: it is
//! not exact, and a client can briefly exceed the nominal rate right after
//! a cluster of releases.
//!
//! Releases are not timer tasks. Each reservation is pushed onto a queue of
//! `(expiry, identity)` pairs kept inside the registry. Since every hold has
//! the same length the queue is ordered by expiry, so due entries are popped
//! from the front on each admission and on each sweep tick.

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use prometheus::Gauge;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::{RATE_LIMIT_REQUESTS, RATE_LIMIT_WINDOW, SWEEP_INTERVAL};
use crate::error::ApiError;
use crate::metrics::{RATE_LIMITED_TOTAL, TRACKED_CLIENTS};
use crate::middleware::RequestId;

/// Time source for the limiter, swapped out in tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub window: Duration,
    // buckets idle longer than this are evicted
    pub idle_retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: RATE_LIMIT_REQUESTS,
            window: RATE_LIMIT_WINDOW,
            idle_retention: RATE_LIMIT_WINDOW * 3,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

// One bucket per client identity
#[derive(Debug)]
struct ClientBucket {
    outstanding: u32,
    last_seen: Instant,
}

#[derive(Default)]
struct Registry {
    buckets: HashMap<String, ClientBucket>,
    releases: VecDeque<(Instant, String)>,
}

impl Registry {
    // give back every reservation whose hold has elapsed
    fn release_due(&mut self, now: Instant) {
        while let Some((expiry, _)) = self.releases.front() {
            if *expiry > now {
                break;
            }
            if let Some((_, identity)) = self.releases.pop_front() {
                if let Some(bucket) = self.buckets.get_mut(&identity) {
                    bucket.outstanding = bucket.outstanding.saturating_sub(1);
                }
            }
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    hold: Duration,
    registry: Mutex<Registry>,
    clock: Arc<dyn Clock>,
    // mirrors the bucket count for scrapes
    tracked_gauge: Gauge,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.capacity.max(1);
        let hold = config.window / capacity;
        Self {
            config: RateLimitConfig { capacity, ..config },
            hold,
            registry: Mutex::new(Registry::default()),
            clock,
            tracked_gauge: TRACKED_CLIENTS.clone(),
        }
    }

    /// How long one admission keeps its slot.
    pub fn hold(&self) -> Duration {
        self.hold
    }

    /// Returns `true` and takes a reservation if `identity` has a free slot.
    /// A rejected attempt takes nothing but still counts as activity.
    pub fn admit(&self, identity: &str) -> bool {
        let now = self.clock.now();
        let mut registry = self.registry.lock();
        registry.release_due(now);

        // lookup and creation happen under the same lock
        let tracked = registry.buckets.len();
        let bucket = registry
            .buckets
            .entry(identity.to_string())
            .or_insert(ClientBucket {
                outstanding: 0,
                last_seen: now,
            });
        bucket.last_seen = now;
        let rejected = bucket.outstanding >= self.config.capacity;
        if !rejected {
            bucket.outstanding += 1;
        }

        if registry.buckets.len() != tracked {
            self.tracked_gauge.set(registry.buckets.len() as f64);
        }
        if rejected {
            return false;
        }

        registry
            .releases
            .push_back((now + self.hold, identity.to_string()));
        true
    }

    /// Releases due reservations and evicts idle buckets. Returns the number
    /// of evicted buckets.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let retention = self.config.idle_retention;
        let mut registry = self.registry.lock();
        registry.release_due(now);

        let before = registry.buckets.len();
        registry
            .buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) <= retention);
        let evicted = before - registry.buckets.len();
        self.tracked_gauge.set(registry.buckets.len() as f64);
        evicted
    }

    /// Reservations currently held by `identity`.
    pub fn outstanding(&self, identity: &str) -> u32 {
        let now = self.clock.now();
        let mut registry = self.registry.lock();
        registry.release_due(now);
        registry
            .buckets
            .get(identity)
            .map(|bucket| bucket.outstanding)
            .unwrap_or(0)
    }

    pub fn tracked_clients(&self) -> usize {
        self.registry.lock().buckets.len()
    }
}

// Reclamation loop - runs every sweep interval until shutdown is signalled
pub async fn run_sweeper(limiter: Arc<RateLimiter>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(limiter.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    info!(interval = ?limiter.config.sweep_interval, "Rate limit sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = limiter.sweep();
                if evicted > 0 {
                    debug!(evicted, remaining = limiter.tracked_clients(), "Evicted idle rate limit buckets");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Rate limit sweeper stopped");
}

/// Normalizes a client address so one client maps to one bucket: the port
/// and IPv6 brackets are dropped and IPv4-mapped IPv6 addresses become IPv4.
pub fn client_identity(addr: &str) -> String {
    let addr = addr.trim();
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return normalize_ip(socket.ip());
    }
    let bare = addr.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return normalize_ip(ip);
    }
    // host:port with a non-IP host
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            host.to_ascii_lowercase()
        }
        _ => addr.to_ascii_lowercase(),
    }
}

fn normalize_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

// Rate limit middleware, applied before any handler runs
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let identity = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| client_identity(&addr.to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    if !limiter.admit(&identity) {
        RATE_LIMITED_TOTAL.inc();
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_default();
        warn!(request_id = %request_id, client_ip = %identity, "Rate limit exceeded");
        return ApiError::RateLimited.into_response();
    }

    next.run(request).await
}
