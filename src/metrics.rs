//! Prometheus metrics for the select data-plane
//!
//! Emitted, never consumed: per-query work histograms, dedup and
//! skipped-row counters, and an in-flight search gauge.

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, register_histogram, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Rows delivered to the per-series callback, per query.
    pub static ref PER_QUERY_ROWS_PROCESSED: Histogram = register_histogram!(
        "vm_per_query_rows_processed_count",
        "Rows processed per search query",
        exponential_buckets(1.0, 10.0, 10).unwrap()
    ).unwrap();

    /// Series dispatched to workers, per query.
    pub static ref PER_QUERY_SERIES_PROCESSED: Histogram = register_histogram!(
        "vm_per_query_series_processed_count",
        "Series processed per search query",
        exponential_buckets(1.0, 10.0, 8).unwrap()
    ).unwrap();

    /// Samples collapsed by deduplication, by call site.
    pub static ref DEDUPLICATED_SAMPLES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vm_deduplicated_samples_total",
        "Samples removed by adjacent-sample deduplication",
        &["type"]
    ).unwrap();

    /// Rows read from storage but outside the query time range.
    pub static ref METRIC_ROWS_SKIPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vm_metric_rows_skipped_total",
        "Rows skipped because they fall outside the query time range",
        &["name"]
    ).unwrap();

    /// Search queries currently between driver entry and handle release.
    pub static ref INFLIGHT_SEARCH_QUERIES: IntGauge = register_int_gauge!(
        "vm_inflight_search_queries",
        "Search queries currently being processed"
    ).unwrap();
}

/// Record per-query totals after all series completions were collected.
#[inline]
pub fn record_per_query_stats(rows_processed: usize, series_processed: usize) {
    PER_QUERY_ROWS_PROCESSED.observe(rows_processed as f64);
    PER_QUERY_SERIES_PROCESSED.observe(series_processed as f64);
}

/// Record samples collapsed by the select-path dedup pass.
#[inline]
pub fn record_deduplicated_samples(n: usize) {
    if n > 0 {
        DEDUPLICATED_SAMPLES_TOTAL
            .with_label_values(&["select"])
            .inc_by(n as u64);
    }
}

/// Record rows clipped away by the block decoder.
#[inline]
pub fn record_skipped_rows(n: usize) {
    if n > 0 {
        METRIC_ROWS_SKIPPED_TOTAL
            .with_label_values(&["vmselect"])
            .inc_by(n as u64);
    }
}

/// RAII guard for the in-flight search gauge.
///
/// Held by the query driver from entry until the search resources are
/// released, so the gauge decrements on every exit path.
pub struct InflightQueryGuard(());

impl InflightQueryGuard {
    /// Enter the in-flight section.
    pub fn enter() -> Self {
        INFLIGHT_SEARCH_QUERIES.inc();
        Self(())
    }
}

impl Drop for InflightQueryGuard {
    fn drop(&mut self) {
        INFLIGHT_SEARCH_QUERIES.dec();
    }
}

/// Get metrics in Prometheus text format
///
/// # Returns
///
/// Result containing the formatted metrics string, or an error if encoding fails
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}
