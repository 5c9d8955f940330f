//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and watcher progress
//! - Observed events and duplicates
//! - Swap and secret lifecycle transitions
//! - Submissions and scan loop timing

use crate::error::{ResolverError, ResolverResult};
use crate::ledger::SwapStatus;
use crate::vault::SecretStatus;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::future::Future;
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "bmn_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "bmn_chain_block_height",
        "Latest block seen by the watcher per chain",
        &["chain_id"]
    ).unwrap();

    pub static ref WATCHER_STATE: GaugeVec = register_gauge_vec!(
        "bmn_watcher_state",
        "Watcher state (0=stopped, 1=catching up, 2=live)",
        &["chain_id"]
    ).unwrap();

    pub static ref REORGS_DETECTED: CounterVec = register_counter_vec!(
        "bmn_reorgs_detected_total",
        "Reveal transactions dropped by a reorg",
        &["chain_id"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "bmn_events_received_total",
        "Total events received by type",
        &["chain_id", "event_type"]
    ).unwrap();

    pub static ref EVENTS_DUPLICATE: CounterVec = register_counter_vec!(
        "bmn_events_duplicate_total",
        "Events delivered more than once and skipped",
        &["chain_id"]
    ).unwrap();

    // Lifecycle metrics
    pub static ref SWAP_TRANSITIONS: CounterVec = register_counter_vec!(
        "bmn_swap_transitions_total",
        "Swap records entering each status",
        &["status"]
    ).unwrap();

    pub static ref SECRET_TRANSITIONS: CounterVec = register_counter_vec!(
        "bmn_secret_transitions_total",
        "Secret records entering each status",
        &["status"]
    ).unwrap();

    pub static ref INVARIANT_VIOLATIONS: CounterVec = register_counter_vec!(
        "bmn_invariant_violations_total",
        "Updates refused because they would break a ledger or vault invariant",
        &["kind"]
    ).unwrap();

    // Transaction metrics
    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "bmn_submissions_total",
        "Outbound actions by result",
        &["chain_id", "action", "result"]
    ).unwrap();

    pub static ref SCAN_DURATION: HistogramVec = register_histogram_vec!(
        "bmn_scan_duration_seconds",
        "Duration of one next-action scan",
        &[],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "bmn_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "bmn_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> ResolverResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ResolverError::Config(format!("cannot bind metrics on {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ResolverError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_blocks_processed(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_watcher_state(chain_id: u64, state: u8) {
    WATCHER_STATE
        .with_label_values(&[&chain_id.to_string()])
        .set(state as f64);
}

pub fn record_reorg(chain_id: u64) {
    REORGS_DETECTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_event(chain_id: u64, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[&chain_id.to_string(), event_type])
        .inc();
}

pub fn record_duplicate_event(chain_id: u64) {
    EVENTS_DUPLICATE
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_swap_transition(status: SwapStatus) {
    SWAP_TRANSITIONS.with_label_values(&[status.as_str()]).inc();
}

pub fn record_secret_transition(status: SecretStatus) {
    SECRET_TRANSITIONS
        .with_label_values(&[&status.to_string()])
        .inc();
}

pub fn record_invariant_violation(kind: &str) {
    INVARIANT_VIOLATIONS.with_label_values(&[kind]).inc();
}

pub fn record_submission(chain_id: u64, action: &str, success: bool) {
    let result = if success { "ok" } else { "error" };
    SUBMISSIONS
        .with_label_values(&[&chain_id.to_string(), action, result])
        .inc();
}

pub fn record_scan_duration(secs: f64) {
    SCAN_DURATION.with_label_values(&[]).observe(secs);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
