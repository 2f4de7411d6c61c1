//! Prometheus Metrics Module
//!
//! Installs the Prometheus recorder and describes every gateway metric.
//! Components record through the `metrics` macros directly.
//!
//! # Metrics Categories
//!
//! - **Connection**: session state, transitions, reconnects, heartbeats
//! - **Dispatch**: order receipts, throttling, retries, request timeouts
//! - **Pipeline**: events received, forwarded backlog, shed telemetry
//! - **Reconciliation**: passes, unresolved orders, checkpoints
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder. Later calls return the
/// existing handle.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Connection
    describe_gauge!(
        "gateway_connection_state",
        "Connection state code (0 disconnected .. 5 failed permanently)"
    );
    describe_counter!(
        "gateway_state_transitions_total",
        "Accepted connection state transitions by target state"
    );
    describe_counter!(
        "gateway_reconnect_attempts_total",
        "Reconnect attempts after backoff"
    );
    describe_counter!(
        "gateway_heartbeat_timeouts_total",
        "Heartbeats not acknowledged in time"
    );
    describe_gauge!(
        "gateway_health_status",
        "Aggregate health (0 healthy, 1 degraded, 2 down)"
    );

    // Dispatch
    describe_counter!(
        "gateway_order_receipts_total",
        "Order intent receipts by result"
    );
    describe_counter!(
        "gateway_rate_limited_total",
        "Requests refused or delayed by the rate limiter, by class"
    );
    describe_counter!(
        "gateway_dispatch_retries_total",
        "Transient dispatch failures retried, by operation"
    );
    describe_counter!(
        "gateway_request_timeouts_total",
        "Correlated requests that timed out, by request"
    );
    describe_gauge!(
        "gateway_requests_in_flight",
        "Correlated requests awaiting a broker response"
    );
    describe_counter!(
        "gateway_order_modifications_total",
        "Order modifications sent to the broker"
    );
    describe_counter!(
        "gateway_orphan_commissions_total",
        "Commission reports for executions the cache does not know"
    );
    describe_counter!(
        "gateway_subscriptions_restored_total",
        "Market data subscriptions replayed after reconnect"
    );

    // Pipeline
    describe_counter!(
        "gateway_events_received_total",
        "Broker events entering the pipeline, by kind"
    );
    describe_counter!(
        "gateway_order_events_total",
        "Order events applied to state, by outcome"
    );
    describe_gauge!(
        "gateway_forward_backlog",
        "Canonical events waiting for the downstream consumer"
    );
    describe_counter!(
        "gateway_forward_shed_total",
        "Telemetry events shed under backpressure"
    );

    // Reconciliation
    describe_counter!(
        "gateway_reconciliations_total",
        "Reconciliation passes by result"
    );
    describe_histogram!(
        "gateway_reconciliation_duration_seconds",
        Unit::Seconds,
        "Duration of successful reconciliation passes"
    );
    describe_gauge!(
        "gateway_unresolved_orders",
        "Orders flagged closed-unknown that the broker could not resolve"
    );
    describe_counter!(
        "gateway_checkpoints_saved_total",
        "Checkpoints written"
    );
    describe_counter!(
        "gateway_checkpoints_discarded_total",
        "Stored checkpoints rejected on startup"
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_is_absent_until_initialized_then_stable() {
        // Other tests never install a recorder, so the first call wins.
        let first = init_metrics().unwrap();
        metrics::counter!("gateway_checkpoints_saved_total").increment(1);

        let rendered = get_metrics_handle().unwrap().render();
        assert!(rendered.contains("gateway_checkpoints_saved_total"));
        assert_eq!(init_metrics().unwrap().render(), first.render());
    }
}
