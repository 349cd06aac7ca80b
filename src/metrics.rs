//! Prometheus metrics for the bridge relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

lazy_static! {
    // Scanning
    pub static ref CHAIN_HEAD: GaugeVec = register_gauge_vec!(
        "relayer_chain_head",
        "Latest head block seen on a chain",
        &["chain"]
    ).expect("valid metric definition");

    pub static ref WATERMARK: GaugeVec = register_gauge_vec!(
        "relayer_watermark",
        "Last scanned block per chain and direction",
        &["chain", "direction"]
    ).expect("valid metric definition");

    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "relayer_events_observed_total",
        "Source events appended to the event log",
        &["direction"]
    ).expect("valid metric definition");

    pub static ref DUPLICATE_EVENTS: CounterVec = register_counter_vec!(
        "relayer_duplicate_events_total",
        "Source events re-observed after they were already recorded",
        &["direction"]
    ).expect("valid metric definition");

    pub static ref REORGS_DETECTED: CounterVec = register_counter_vec!(
        "relayer_reorgs_detected_total",
        "Records whose source block was no longer canonical",
        &["direction", "severity"]
    ).expect("valid metric definition");

    // Submission
    pub static ref RESERVATIONS: CounterVec = register_counter_vec!(
        "relayer_reservations_total",
        "Action reservation outcomes",
        &["direction", "outcome"]
    ).expect("valid metric definition");

    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "relayer_submissions_total",
        "Destination transactions broadcast",
        &["direction", "status"]
    ).expect("valid metric definition");

    pub static ref RECORDS_FINALIZED: CounterVec = register_counter_vec!(
        "relayer_records_finalized_total",
        "Records that reached Finalized",
        &["direction"]
    ).expect("valid metric definition");

    pub static ref RECORDS_FAILED: CounterVec = register_counter_vec!(
        "relayer_records_failed_total",
        "Records that reached Failed",
        &["direction"]
    ).expect("valid metric definition");

    pub static ref RELAY_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_relay_latency_seconds",
        "Time from first observation to finalization",
        &["direction"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    ).expect("valid metric definition");

    pub static ref RECORDS_BY_STATUS: GaugeVec = register_gauge_vec!(
        "relayer_records",
        "Relay records per status",
        &["direction", "status"]
    ).expect("valid metric definition");

    // Errors
    pub static ref RPC_RETRIES: CounterVec = register_counter_vec!(
        "relayer_rpc_retries_total",
        "Connector calls retried after a transient error",
        &["chain", "op"]
    ).expect("valid metric definition");

    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Errors absorbed by the relay loops",
        &["direction", "type"]
    ).expect("valid metric definition");

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).expect("valid metric definition");

    pub static ref LAST_SUCCESSFUL_POLL: GaugeVec = register_gauge_vec!(
        "relayer_last_successful_poll_timestamp",
        "Unix timestamp of the last completed scan pass",
        &["direction"]
    ).expect("valid metric definition");
}

pub fn set_chain_head(chain: &str, head: u64) {
    CHAIN_HEAD.with_label_values(&[chain]).set(head as f64);
}

pub fn set_watermark(chain: &str, direction: &str, block: u64) {
    WATERMARK
        .with_label_values(&[chain, direction])
        .set(block as f64);
}

pub fn record_event_observed(direction: &str) {
    EVENTS_OBSERVED.with_label_values(&[direction]).inc();
}

pub fn record_duplicate_event(direction: &str) {
    DUPLICATE_EVENTS.with_label_values(&[direction]).inc();
}

/// `severity` is "reverted" for records sent back to Pending and
/// "reconciliation" when a destination action was already issued
pub fn record_reorg(direction: &str, severity: &str) {
    REORGS_DETECTED
        .with_label_values(&[direction, severity])
        .inc();
}

pub fn record_reservation(direction: &str, outcome: &str) {
    RESERVATIONS
        .with_label_values(&[direction, outcome])
        .inc();
}

/// Record a destination transaction broadcast
pub fn record_submission(direction: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    SUBMISSIONS.with_label_values(&[direction, status]).inc();
}

/// Record a finalized relay and its end-to-end latency
pub fn record_finalized(direction: &str, latency_seconds: f64) {
    RECORDS_FINALIZED.with_label_values(&[direction]).inc();
    RELAY_LATENCY
        .with_label_values(&[direction])
        .observe(latency_seconds.max(0.0));
}

pub fn record_failed(direction: &str) {
    RECORDS_FAILED.with_label_values(&[direction]).inc();
}

pub fn set_records_by_status(direction: &str, status: &str, count: u64) {
    RECORDS_BY_STATUS
        .with_label_values(&[direction, status])
        .set(count as f64);
}

pub fn record_rpc_retry(chain: &str, op: &str) {
    RPC_RETRIES.with_label_values(&[chain, op]).inc();
}

/// Record an error
pub fn record_error(direction: &str, error_type: &str) {
    ERRORS.with_label_values(&[direction, error_type]).inc();
}

/// Record last successful poll
pub fn record_successful_poll(direction: &str) {
    LAST_SUCCESSFUL_POLL
        .with_label_values(&[direction])
        .set(chrono::Utc::now().timestamp() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let before = SUBMISSIONS
            .with_label_values(&["metrics_test", "success"])
            .get();
        record_submission("metrics_test", true);
        assert_eq!(
            SUBMISSIONS
                .with_label_values(&["metrics_test", "success"])
                .get(),
            before + 1.0
        );
    }

    #[test]
    fn test_gauges_set() {
        set_watermark("metrics_test", "lock_mint", 1234);
        assert_eq!(
            WATERMARK
                .with_label_values(&["metrics_test", "lock_mint"])
                .get(),
            1234.0
        );
    }
}
