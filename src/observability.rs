//! Logging setup and the sink for background cache failures
//!
//! Cache reads, background cache writes and invalidations never fail a load.
//! Their failures are reported to a [`CacheEventSink`] instead, so callers can
//! observe them without parsing log output.

use crate::metrics::GatewayMetrics;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// A recovered failure in the cache-aside path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Multi-get failed; the batch was treated as all misses
    ReadFailed { keyspace: String, error: String },
    /// Background write of a fetched entity failed
    WriteFailed { key: String, error: String },
    /// Backend call failed; the batch resolved to "not found"
    BatchFailed {
        keyspace: String,
        keys: usize,
        error: String,
    },
    /// Exact delete or pattern sweep failed
    InvalidationFailed { target: String, error: String },
}

impl CacheEvent {
    /// Short operation name used as a metrics label
    pub fn operation(&self) -> &'static str {
        match self {
            CacheEvent::ReadFailed { .. } => "read",
            CacheEvent::WriteFailed { .. } => "write",
            CacheEvent::BatchFailed { .. } => "batch",
            CacheEvent::InvalidationFailed { .. } => "invalidate",
        }
    }
}

/// Receiver of recovered cache-path failures
pub trait CacheEventSink: Send + Sync {
    fn record(&self, event: CacheEvent);
}

/// Shared sink handle
pub type SharedCacheEventSink = Arc<dyn CacheEventSink>;

/// Default sink: logs at `warn` and counts in Prometheus
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl CacheEventSink for TracingSink {
    fn record(&self, event: CacheEvent) {
        let metrics = GatewayMetrics::global();
        match &event {
            CacheEvent::ReadFailed { keyspace, error } => {
                warn!(
                    keyspace = %keyspace,
                    error = %error,
                    "Cache read failed, treating batch as misses"
                );
                metrics.record_cache_error(event.operation());
            }
            CacheEvent::WriteFailed { key, error } => {
                warn!(key = %key, error = %error, "Cache write failed");
                metrics.record_cache_error(event.operation());
            }
            CacheEvent::BatchFailed {
                keyspace,
                keys,
                error,
            } => {
                warn!(
                    keyspace = %keyspace,
                    keys = keys,
                    error = %error,
                    "Batch load failed, resolving keys as not found"
                );
                metrics.record_batch_failure(keyspace);
            }
            CacheEvent::InvalidationFailed { target, error } => {
                warn!(target_key = %target, error = %error, "Cache invalidation failed");
                metrics.record_cache_error(event.operation());
            }
        }
    }
}

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over `default_filter`. A second call is a no-op.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .try_init();
}
