use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
};
use std::sync::Arc;

/// Metrics recorded around every transaction manager call
pub struct TxmMetrics {
    pub call_duration: HistogramVec,
    pub call_total: IntCounterVec,
}

impl TxmMetrics {
    /// Create new manager metrics with the provided registry
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let call_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "txm_call_duration_seconds",
                "Time taken by one transaction manager call"
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0
            ]),
            &["chain_id", "method", "success"],
            registry
        )?;

        let call_total = register_int_counter_vec_with_registry!(
            Opts::new(
                "txm_call_total",
                "Number of transaction manager calls by outcome"
            ),
            &["chain_id", "method", "success"],
            registry
        )?;

        Ok(TxmMetrics {
            call_duration,
            call_total,
        })
    }
}

lazy_static! {
    /// Default metrics registry (fallback if no external registry provided)
    static ref DEFAULT_TXM_METRICS_REGISTRY: Registry = Registry::new();

    /// Default metrics instance, `None` only if registration failed
    static ref DEFAULT_TXM_METRICS: Option<Arc<TxmMetrics>> =
        match TxmMetrics::new(&DEFAULT_TXM_METRICS_REGISTRY) {
            Ok(metrics) => Some(Arc::new(metrics)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to register default transaction manager metrics");
                None
            }
        };

    /// Global metrics instance - can be set by the binary crate or uses default
    static ref TXM_METRICS_INSTANCE: std::sync::RwLock<Option<Arc<TxmMetrics>>> =
        std::sync::RwLock::new(None);
}

/// Initialize metrics with a custom registry
/// This should be called once at application startup by the binary crate
pub fn initialize_metrics(metrics: TxmMetrics) {
    match TXM_METRICS_INSTANCE.write() {
        Ok(mut instance) => *instance = Some(Arc::new(metrics)),
        Err(e) => tracing::error!(error = %e, "Metrics instance lock poisoned, keeping defaults"),
    }
}

/// Get the current metrics instance (either custom or default)
fn get_metrics() -> Option<Arc<TxmMetrics>> {
    let custom = TXM_METRICS_INSTANCE
        .read()
        .ok()
        .and_then(|instance| instance.clone());

    custom.or_else(|| DEFAULT_TXM_METRICS.clone())
}

/// Export metrics in Prometheus format from the default registry
/// For custom registries, the binary crate should handle metrics export directly
pub fn export_default_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = DEFAULT_TXM_METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record the duration and outcome of one manager call
pub fn record_call(chain_id: u64, method: &str, success: bool, duration_seconds: f64) {
    let Some(metrics) = get_metrics() else {
        return;
    };

    let chain_id = chain_id.to_string();
    let success = if success { "true" } else { "false" };
    let labels = [chain_id.as_str(), method, success];

    metrics
        .call_duration
        .with_label_values(&labels)
        .observe(duration_seconds);
    metrics.call_total.with_label_values(&labels).inc();
}

/// Helper to calculate duration in seconds from unix timestamps (milliseconds)
pub fn calculate_duration_seconds(start_timestamp_ms: u64, end_timestamp_ms: u64) -> f64 {
    (end_timestamp_ms.saturating_sub(start_timestamp_ms)) as f64 / 1000.0
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
