//! Prometheus metrics helpers for skyfeed.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions used across skyfeed components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use skyfeed_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     metrics::counter!("ingest_events_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`upstream_`, `ingest_`, `classifier_`, `reconcile_`, `store_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: only `feed`, `step` and `reason`, all low-cardinality

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds the `/metrics` endpoint on the given port, then serves it from a
/// background task and returns.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics used across skyfeed.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Upstream Gateway
    // =========================================================================

    describe_counter!(
        "upstream_requests_total",
        "Attempts made through the upstream gateway (retries included)"
    );
    describe_counter!("upstream_successes_total", "Successful upstream attempts");
    describe_counter!("upstream_failures_total", "Failed upstream attempts");
    describe_counter!(
        "upstream_circuit_trips_total",
        "Times the circuit breaker opened"
    );
    describe_counter!(
        "upstream_circuit_rejections_total",
        "Calls rejected while the circuit breaker was open"
    );
    describe_counter!(
        "upstream_retries_exhausted_total",
        "Calls that failed after exhausting every retry"
    );
    describe_gauge!(
        "upstream_consecutive_failures",
        "Current consecutive failure count of the circuit breaker"
    );
    describe_histogram!(
        "upstream_wait_seconds",
        "Time spent waiting for a rate-limit slot"
    );

    // =========================================================================
    // Stream Ingestion
    // =========================================================================

    describe_counter!("ingest_events_total", "Stream events received");
    describe_counter!(
        "ingest_events_invalid_total",
        "Stream messages rejected at the ingestion boundary"
    );
    describe_counter!(
        "ingest_posts_accepted_total",
        "Posts accepted by at least one feed and stored"
    );
    describe_counter!(
        "ingest_posts_discarded_total",
        "Posts accepted by no feed and discarded"
    );
    describe_counter!("ingest_posts_deleted_total", "Post deletions applied");
    describe_counter!(
        "ingest_store_errors_total",
        "Store operations that failed during ingestion"
    );
    describe_counter!("ingest_reconnects_total", "Stream reconnect attempts");
    describe_gauge!(
        "ingest_seconds_since_last_event",
        "Seconds since the last accepted stream event"
    );
    describe_gauge!(
        "ingest_connection_age_seconds",
        "Seconds since the stream connection was opened"
    );
    describe_gauge!("ingest_connected", "Whether the stream is connected (1=yes, 0=no)");

    // =========================================================================
    // Classifiers
    // =========================================================================

    describe_counter!(
        "classifier_accepted_total",
        "Items accepted per feed (label: feed)"
    );
    describe_counter!(
        "classifier_errors_total",
        "Classifier errors treated as abstentions (label: feed)"
    );
    describe_counter!(
        "classifier_match_cache_hits_total",
        "Match cache hits (label: feed)"
    );
    describe_counter!(
        "classifier_match_cache_overflows_total",
        "Match cache wipes on overflow (label: feed)"
    );
    describe_counter!(
        "classifier_maintenance_errors_total",
        "Periodic maintenance sub-step failures (labels: feed, step)"
    );
    describe_counter!(
        "classifier_backfilled_total",
        "Posts stored by author backfill (label: feed)"
    );
    describe_gauge!("classifier_allow_set_size", "Allow-set size (label: feed)");
    describe_gauge!("classifier_block_set_size", "Block-set size (label: feed)");
    describe_histogram!(
        "classifier_maintenance_duration_seconds",
        "Duration of a maintenance run (label: feed)"
    );

    // =========================================================================
    // Label Reconciliation
    // =========================================================================

    describe_counter!("reconcile_runs_total", "Reconciliation runs completed");
    describe_counter!("reconcile_run_errors_total", "Reconciliation runs that failed");
    describe_counter!("reconcile_items_updated_total", "Items whose labels were written");
    describe_counter!("reconcile_chunks_failed_total", "Lookup chunks that failed");
    describe_histogram!(
        "reconcile_duration_seconds",
        "Duration of a reconciliation run"
    );

    // =========================================================================
    // Store
    // =========================================================================

    describe_counter!(
        "store_items_expired_total",
        "Items garbage-collected after losing their last feed tag"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Increment a counter labelled with a feed name.
#[inline]
pub fn increment_for_feed(name: &'static str, feed: &str, count: u64) {
    metrics::counter!(name, "feed" => feed.to_string()).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_helpers_do_not_panic() {
        ensure_metrics_init();
        increment("test_counter", 0);
        increment("test_counter", 5);
        increment_for_feed("test_feed_counter", "rust", 1);
        set_gauge("test_gauge", 42.5);
        set_gauge("test_gauge", -1.0);
    }

    #[test]
    fn test_register_common_metrics_is_repeatable() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }
}
