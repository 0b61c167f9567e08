//! Metrics and tracing facade for Facet.
//!
//! The helpers here emit both metrics (via the `metrics` crate) and
//! lightweight tracing events.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tracing::trace;

/// Record latency for query execution in milliseconds.
pub fn record_query_latency(latency: Duration) {
    let ms = latency.as_secs_f64() * 1_000.0;
    histogram!("facet.query.latency_ms").record(ms);
    trace!(latency_ms = ms, "query latency observed");
}

/// Count queries answered from the result cache.
pub fn record_cache_hit() {
    counter!("facet.query.cache_hits_total").increment(1);
    trace!("query cache hit recorded");
}

/// Record latency of one drain-and-clean cycle in milliseconds.
pub fn record_clean_latency(latency: Duration) {
    let ms = latency.as_secs_f64() * 1_000.0;
    histogram!("facet.clean.latency_ms").record(ms);
    trace!(latency_ms = ms, "clean latency observed");
}

/// Count cleaned records produced by a drain cycle.
pub fn record_drain_batch(cleaned: u64) {
    if cleaned == 0 {
        return;
    }
    counter!("facet.clean.records_total").increment(cleaned);
    trace!(cleaned, "drain batch recorded");
}

/// Track the current depth of the ingestion buffer.
pub fn record_buffer_depth(depth: u64) {
    gauge!("facet.buffer.depth").set(depth as f64);
    trace!(depth, "buffer depth recorded");
}

/// Track total records dropped by the buffer overflow policy.
pub fn record_buffer_dropped(dropped_total: u64) {
    gauge!("facet.buffer.dropped_total").set(dropped_total as f64);
    trace!(dropped_total, "buffer drops recorded");
}
