use lazy_static::lazy_static;
use prometheus::{
    Gauge, Histogram, IntCounter, IntCounterVec, register_gauge, register_histogram,
    register_int_counter, register_int_counter_vec,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: IntCounter =
        register_int_counter!("gateway_requests_total", "Total number of query requests")
            .expect("register gateway_requests_total");
    pub static ref RATE_LIMITED_TOTAL: IntCounter = register_int_counter!(
        "gateway_rate_limited_total",
        "Requests rejected by the rate limiter"
    )
    .expect("register gateway_rate_limited_total");
    pub static ref QUERY_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "gateway_query_outcomes_total",
        "Query executions by outcome",
        &["outcome"]
    )
    .expect("register gateway_query_outcomes_total");
    pub static ref QUERY_LATENCY: Histogram = register_histogram!(
        "gateway_query_latency_seconds",
        "Query execution latency in seconds"
    )
    .expect("register gateway_query_latency_seconds");
    pub static ref TRACKED_CLIENTS: Gauge = register_gauge!(
        "gateway_rate_limit_clients",
        "Client buckets held by the rate limiter"
    )
    .expect("register gateway_rate_limit_clients");
}

// Outcome labels for QUERY_OUTCOMES
pub const OUTCOMES: [&str; 6] = [
    "success",
    "engine_error",
    "timeout",
    "cancelled",
    "unavailable",
    "processing_error",
];

// Touch every label so all series exist from the first scrape
pub fn init() {
    for outcome in OUTCOMES {
        QUERY_OUTCOMES.with_label_values(&[outcome]);
    }
}

pub fn record_outcome(outcome: &str) {
    QUERY_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn outcome_count(outcome: &str) -> u64 {
    QUERY_OUTCOMES.with_label_values(&[outcome]).get()
}

/// Resident and virtual memory of this process in bytes, read from
/// `/proc/self/status`, which reports kB regardless of the kernel page size.
/// Zero on platforms without procfs.
pub fn process_memory() -> (u64, u64) {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => parse_status_memory(&status),
        Err(_) => (0, 0),
    }
}

fn parse_status_memory(status: &str) -> (u64, u64) {
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };
    (field("VmRSS:"), field("VmSize:"))
}
