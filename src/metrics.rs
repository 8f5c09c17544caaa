//! Prometheus metrics for backend calls, batching and the shared cache.
//!
//! # Metrics Exposed
//!
//! - `grpc_backend_requests_total` - Backend attempts by service and method
//! - `grpc_backend_duration_seconds` - Backend attempt latency histogram
//! - `grpc_backend_errors_total` - Failed backend attempts by status code
//! - `grpc_backend_retries_total` - Retries scheduled after transient failures
//! - `circuit_breaker_rejections_total` - Calls refused by an open breaker
//! - `dataloader_batches_total` - Batches dispatched per key-space
//! - `dataloader_batch_keys` - Keys per dispatched batch
//! - `dataloader_cache_lookups_total` - Shared cache hits and misses per key-space
//! - `dataloader_batch_failures_total` - Batches resolved to "not found" after a backend error
//! - `cache_errors_total` - Shared cache failures by operation
//!
//! # Example
//!
//! ```rust,no_run
//! use erp_gateway::GatewayMetrics;
//!
//! let metrics = GatewayMetrics::global();
//! metrics.record_batch("crm.contacts", 12);
//! println!("{}", metrics.render());
//! ```

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::time::Instant;

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Buckets for keys per batch, up to the largest batch size
const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0];

/// Global metrics registry for the gateway
static METRICS: Lazy<GatewayMetrics> = Lazy::new(GatewayMetrics::new);

/// Gateway metrics for Prometheus monitoring.
#[derive(Clone)]
pub struct GatewayMetrics {
    pub grpc_requests: IntCounterVec,
    pub grpc_duration: HistogramVec,
    pub grpc_errors: IntCounterVec,
    pub grpc_retries: IntCounterVec,
    pub breaker_rejections: IntCounterVec,
    pub loader_batches: IntCounterVec,
    pub loader_batch_keys: HistogramVec,
    pub loader_cache_lookups: IntCounterVec,
    pub loader_batch_failures: IntCounterVec,
    pub cache_errors: IntCounterVec,
}

impl GatewayMetrics {
    /// Create a new metrics instance with registered Prometheus metrics
    pub fn new() -> Self {
        Self {
            grpc_requests: register_int_counter_vec!(
                "grpc_backend_requests_total",
                "Total number of gRPC backend requests",
                &["service", "method"]
            )
            .expect("metric can be created"),

            grpc_duration: register_histogram_vec!(
                "grpc_backend_duration_seconds",
                "gRPC backend request duration in seconds",
                &["service", "method"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("metric can be created"),

            grpc_errors: register_int_counter_vec!(
                "grpc_backend_errors_total",
                "Total number of gRPC backend errors",
                &["service", "method", "code"]
            )
            .expect("metric can be created"),

            grpc_retries: register_int_counter_vec!(
                "grpc_backend_retries_total",
                "Total number of gRPC backend retries",
                &["service", "method"]
            )
            .expect("metric can be created"),

            breaker_rejections: register_int_counter_vec!(
                "circuit_breaker_rejections_total",
                "Calls rejected by an open circuit breaker",
                &["service"]
            )
            .expect("metric can be created"),

            loader_batches: register_int_counter_vec!(
                "dataloader_batches_total",
                "Batches dispatched by the data loaders",
                &["keyspace"]
            )
            .expect("metric can be created"),

            loader_batch_keys: register_histogram_vec!(
                "dataloader_batch_keys",
                "Number of keys per dispatched batch",
                &["keyspace"],
                BATCH_SIZE_BUCKETS.to_vec()
            )
            .expect("metric can be created"),

            loader_cache_lookups: register_int_counter_vec!(
                "dataloader_cache_lookups_total",
                "Shared cache lookups by result",
                &["keyspace", "result"]
            )
            .expect("metric can be created"),

            loader_batch_failures: register_int_counter_vec!(
                "dataloader_batch_failures_total",
                "Batches resolved to not-found after a backend failure",
                &["keyspace"]
            )
            .expect("metric can be created"),

            cache_errors: register_int_counter_vec!(
                "cache_errors_total",
                "Shared cache operation failures",
                &["operation"]
            )
            .expect("metric can be created"),
        }
    }

    /// Get the global metrics instance
    pub fn global() -> &'static Self {
        &METRICS
    }

    pub fn record_grpc_request(&self, service: &str, method: &str) {
        self.grpc_requests.with_label_values(&[service, method]).inc();
    }

    pub fn record_grpc_duration(&self, service: &str, method: &str, duration_secs: f64) {
        self.grpc_duration
            .with_label_values(&[service, method])
            .observe(duration_secs);
    }

    pub fn record_grpc_error(&self, service: &str, method: &str, code: &str) {
        self.grpc_errors
            .with_label_values(&[service, method, code])
            .inc();
    }

    pub fn record_retry(&self, service: &str, method: &str) {
        self.grpc_retries.with_label_values(&[service, method]).inc();
    }

    pub fn record_breaker_rejection(&self, service: &str) {
        self.breaker_rejections.with_label_values(&[service]).inc();
    }

    /// Record one dispatched batch and its size
    pub fn record_batch(&self, keyspace: &str, keys: usize) {
        self.loader_batches.with_label_values(&[keyspace]).inc();
        self.loader_batch_keys
            .with_label_values(&[keyspace])
            .observe(keys as f64);
    }

    pub fn record_cache_lookups(&self, keyspace: &str, hits: usize, misses: usize) {
        self.loader_cache_lookups
            .with_label_values(&[keyspace, "hit"])
            .inc_by(hits as u64);
        self.loader_cache_lookups
            .with_label_values(&[keyspace, "miss"])
            .inc_by(misses as u64);
    }

    pub fn record_batch_failure(&self, keyspace: &str) {
        self.loader_batch_failures.with_label_values(&[keyspace]).inc();
    }

    pub fn record_cache_error(&self, operation: &str) {
        self.cache_errors.with_label_values(&[operation]).inc();
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer for one backend attempt: counts it on creation, records latency on drop
pub struct GrpcTimer {
    start: Instant,
    service: String,
    method: String,
    metrics: &'static GatewayMetrics,
}

impl GrpcTimer {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        let service = service.into();
        let method = method.into();
        let metrics = GatewayMetrics::global();
        metrics.record_grpc_request(&service, &method);
        Self {
            start: Instant::now(),
            service,
            method,
            metrics,
        }
    }

    /// Record an error for this gRPC call
    pub fn record_error(&self, code: &str) {
        self.metrics
            .record_grpc_error(&self.service, &self.method, code);
    }
}

impl Drop for GrpcTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics
            .record_grpc_duration(&self.service, &self.method, duration);
    }
}
