//! Prometheus Metrics Module
//!
//! Exposes client metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Messages**: inbound payloads per channel kind, malformed frames dropped
//! - **Cache**: hits, misses, evictions, live subscriptions
//! - **Connection**: reconnect attempts
//! - **Queries**: errors per kind, first-message wait time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port. Recording is a
//! no-op until [`init_metrics`] installs the recorder, so library users and
//! tests pay nothing.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::application::error::ErrorKind;
use crate::domain::channel::ChannelKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and describe all metrics.
///
/// Calling it again returns the already installed handle.
///
/// # Errors
///
/// Returns [`BuildError`] if a global recorder is already installed by
/// someone else.
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
    describe_counter!(
        "ir_client_messages_received_total",
        "Payloads received from the exchange by channel kind"
    );
    describe_counter!(
        "ir_client_messages_malformed_total",
        "Inbound frames dropped as malformed"
    );

    describe_counter!("ir_client_cache_hits_total", "Lookups served from the cache");
    describe_counter!(
        "ir_client_cache_misses_total",
        "Lookups that created a new subscription"
    );
    describe_counter!(
        "ir_client_cache_evictions_total",
        "Entries evicted by the idle sweeper"
    );
    describe_gauge!(
        "ir_client_subscriptions_active",
        "Channels currently subscribed"
    );

    describe_counter!(
        "ir_client_reconnects_total",
        "WebSocket reconnection attempts"
    );

    describe_counter!(
        "ir_client_query_errors_total",
        "Failed queries by error kind"
    );
    describe_histogram!(
        "ir_client_first_message_wait_seconds",
        "Time callers waited for the first payload on a new subscription"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a payload received for a channel kind.
pub fn record_message_received(kind: ChannelKind) {
    counter!(
        "ir_client_messages_received_total",
        "channel" => kind.as_str()
    )
    .increment(1);
}

/// Record a malformed inbound frame.
pub fn record_malformed_message() {
    counter!("ir_client_messages_malformed_total").increment(1);
}

/// Record a cache hit.
pub fn record_cache_hit(kind: ChannelKind) {
    counter!("ir_client_cache_hits_total", "channel" => kind.as_str()).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss(kind: ChannelKind) {
    counter!("ir_client_cache_misses_total", "channel" => kind.as_str()).increment(1);
}

/// Record an idle eviction.
pub fn record_eviction(kind: ChannelKind) {
    counter!("ir_client_cache_evictions_total", "channel" => kind.as_str()).increment(1);
}

/// Update the live subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(count: usize) {
    gauge!("ir_client_subscriptions_active").set(count as f64);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("ir_client_reconnects_total").increment(1);
}

/// Record a failed query.
pub fn record_query_error(kind: ErrorKind) {
    counter!("ir_client_query_errors_total", "kind" => kind.as_str()).increment(1);
}

/// Record how long a caller waited for a first payload.
pub fn record_first_message_wait(kind: ChannelKind, duration: Duration) {
    histogram!(
        "ir_client_first_message_wait_seconds",
        "channel" => kind.as_str()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
