//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Listener accepts, handshakes and admission outcomes
//! - Connected nodes and connection supersession
//! - Per-node queue depth, enqueue outcomes, delivery and acks
//! - Inbound routing outcomes and upstream forwards
//! - Resync sweeps and sync-record flushes
//! - Token rotation and validation
//! - Circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `cloudhub_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The embedding process installs the recorder (e.g. a Prometheus exporter);
//! without one, every call here is a cheap no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Listener + Admission
// =============================================================================

/// A transport accepted a raw connection (before TLS).
pub fn record_connection_accepted(protocol: &str) {
    counter!("cloudhub_connections_accepted_total", "protocol" => protocol.to_string()).increment(1);
}

/// A TLS handshake or protocol upgrade failed or timed out.
pub fn record_handshake_failure(protocol: &str, reason: &str) {
    counter!(
        "cloudhub_handshake_failures_total",
        "protocol" => protocol.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Handshake duration, from TCP/QUIC accept to upgraded connection.
pub fn record_handshake_duration(protocol: &str, duration: Duration) {
    histogram!("cloudhub_handshake_duration_seconds", "protocol" => protocol.to_string())
        .record(duration.as_secs_f64());
}

/// A connection was turned away before the handshake (rate limit, bulkhead).
pub fn record_connection_throttled(protocol: &str, guard: &str) {
    counter!(
        "cloudhub_connections_throttled_total",
        "protocol" => protocol.to_string(),
        "guard" => guard.to_string()
    )
    .increment(1);
}

/// Admission outcome. `method` is `certificate` or `token`.
pub fn record_admission(method: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "cloudhub_admissions_total",
        "method" => method.to_string(),
        "status" => status
    )
    .increment(1);
}

// =============================================================================
// Registry
// =============================================================================

pub fn set_connected_nodes(count: usize) {
    gauge!("cloudhub_connected_nodes").set(count as f64);
}

/// A node registered; `superseded` when it replaced a live connection.
pub fn record_node_registered(superseded: bool) {
    let kind = if superseded { "superseded" } else { "fresh" };
    counter!("cloudhub_node_registrations_total", "kind" => kind).increment(1);
}

/// A connection left the registry. `reason`: closed, idle, superseded, frame_error, shutdown.
pub fn record_node_disconnected(reason: &str) {
    counter!("cloudhub_node_disconnects_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_node_destroyed() {
    counter!("cloudhub_nodes_destroyed_total").increment(1);
}

// =============================================================================
// Queue + Dispatcher
// =============================================================================

/// Enqueue outcome: queued, superseded, stale, full, destroyed.
pub fn record_enqueue(outcome: &str) {
    counter!("cloudhub_enqueue_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn set_queue_depth(node: &str, depth: usize) {
    gauge!("cloudhub_queue_depth", "node" => node.to_string()).set(depth as f64);
}

pub fn record_message_sent(protocol: &str) {
    counter!("cloudhub_messages_sent_total", "protocol" => protocol.to_string()).increment(1);
}

pub fn record_send_failure(protocol: &str) {
    counter!("cloudhub_send_failures_total", "protocol" => protocol.to_string()).increment(1);
}

pub fn record_ack() {
    counter!("cloudhub_acks_total").increment(1);
}

// =============================================================================
// Router
// =============================================================================

/// Inbound routing outcome: ack, keepalive, upstream, dropped.
pub fn record_inbound(outcome: &str) {
    counter!("cloudhub_inbound_messages_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_upstream_forward(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("cloudhub_upstream_forwards_total", "status" => status).increment(1);
}

// =============================================================================
// Sync tracker + persistence
// =============================================================================

/// Record a completed resync sweep.
pub fn record_sweep(
    nodes_checked: usize,
    resyncs_enqueued: usize,
    deletes_enqueued: usize,
    errors: usize,
    duration: Duration,
) {
    counter!("cloudhub_sweeps_total").increment(1);
    counter!("cloudhub_sweep_nodes_checked_total").increment(nodes_checked as u64);
    counter!("cloudhub_resyncs_enqueued_total").increment(resyncs_enqueued as u64);
    counter!("cloudhub_deletes_enqueued_total").increment(deletes_enqueued as u64);
    if errors > 0 {
        counter!("cloudhub_sweep_errors_total").increment(errors as u64);
    }
    histogram!("cloudhub_sweep_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_sweep_skipped(reason: &str) {
    counter!("cloudhub_sweeps_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// Record a debounced sync-record flush.
pub fn record_sync_flush(flushed: usize, errors: usize) {
    counter!("cloudhub_sync_flushes_total").increment(1);
    counter!("cloudhub_sync_records_flushed_total").increment(flushed as u64);
    if errors > 0 {
        counter!("cloudhub_sync_flush_errors_total").increment(errors as u64);
    }
}

/// SQLite retry on SQLITE_BUSY / SQLITE_LOCKED.
pub fn sync_store_retries_total(operation: &str) {
    counter!("cloudhub_sync_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Credentials
// =============================================================================

pub fn record_token_rotation(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("cloudhub_token_rotations_total", "status" => status).increment(1);
}

// =============================================================================
// Storage driver socket
// =============================================================================

pub fn record_uds_request(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("cloudhub_uds_requests_total", "status" => status).increment(1);
}

// =============================================================================
// Hub + Circuit Breaker
// =============================================================================

/// Gauge for hub state.
pub fn set_hub_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("cloudhub_hub_state").set(value);
}

pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "cloudhub_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_circuit_rejection(circuit_name: &str) {
    counter!("cloudhub_circuit_rejections_total", "circuit" => circuit_name.to_string()).increment(1);
}
