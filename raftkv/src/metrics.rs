//! Metrics collection for the replica.
//!
//! Request counters and latency histograms per RPC method, plus gauges
//! mirroring the replica's protocol state, exposed through Prometheus.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry};
use std::time::Instant;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Counter for tracking request counts by method
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "request counter"), &["method"]).unwrap();

    /// Histogram for tracking method execution times
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("method_cost", "method cost"),
        &["method"]
    )
    .unwrap();

    /// Gauges for the replica's protocol state
    pub static ref REPLICA_GAUGE_VEC: IntGaugeVec = IntGaugeVec::new(
        Opts::new("replica_state", "replica state"),
        &["field"]
    )
    .unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(REPLICA_GAUGE_VEC.clone()));
}

/// Export the replica's current protocol position.
pub fn observe_replica(term: i64, role: i64, durable_ts: i64, applied_ts: i64) {
    REPLICA_GAUGE_VEC.with_label_values(&["term"]).set(term);
    REPLICA_GAUGE_VEC.with_label_values(&["role"]).set(role);
    REPLICA_GAUGE_VEC
        .with_label_values(&["durable_ts"])
        .set(durable_ts);
    REPLICA_GAUGE_VEC
        .with_label_values(&["applied_ts"])
        .set(applied_ts);
}

/// Records metrics for an async operation: counts the request, runs the
/// handler, observes the elapsed time.
pub async fn record_metrics<F, Fut, T>(
    method_name: &'static str,
    handler: F,
) -> Result<T, tonic::Status>
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<T, tonic::Status>> + Send,
{
    let start = Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let result = handler().await;

    let elapsed = start.elapsed();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());

    result
}
