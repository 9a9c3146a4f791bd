//! Prometheus metrics for the coordinator
//!
//! Privacy-safe metrics: only stage and outcome labels, never ids,
//! labels or conditions.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::error::{CoordinatorError, Result};

pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_REFUSED: &str = "refused";
pub const OUTCOME_EMPTY: &str = "empty";
pub const OUTCOME_INCOMPLETE: &str = "incomplete";
pub const OUTCOME_MISMATCH: &str = "mismatch";
pub const OUTCOME_ERROR: &str = "error";

pub fn record_fanout(kind: &str, outcome: &str, duration: Duration) {
    counter!("spasm_fanout_total", "kind" => kind.to_string(), "outcome" => outcome.to_string()).increment(1);
    histogram!("spasm_fanout_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_key_exchange(outcome: &str) {
    counter!("spasm_key_exchange_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_query(outcome: &str, duration: Duration) {
    counter!("spasm_queries_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("spasm_query_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_query_start() {
    gauge!("spasm_queries_in_flight").increment(1.0);
}

pub fn record_query_end() {
    gauge!("spasm_queries_in_flight").decrement(1.0);
}

pub fn set_custodians_connected(count: usize) {
    gauge!("spasm_custodians_connected").set(count as f64);
}

/// Install the Prometheus recorder with an HTTP scrape endpoint on `addr`
pub fn init_prometheus_recorder(addr: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| CoordinatorError::Metrics(e.to_string()))
}
