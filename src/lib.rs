//! # erp-gateway
//!
//! The data layer of an ERP aggregation gateway: resilient gRPC clients for
//! the backend services and request-scoped batching loaders with a shared
//! cache-aside tier.
//!
//! ## Features
//!
//! - **Circuit breakers**: one per backend service, failing fast while a dependency is down
//! - **Retries**: bounded attempts with exponential backoff and a per-call deadline
//! - **Fallback clients**: services that cannot be connected at startup fail fast with a
//!   clear error
//! - **Batching**: [`EntityLoader`] coalesces lookups into one backend call per key-space
//! - **Shared cache**: Redis or in-memory cache-aside with TTL and post-mutation invalidation
//! - **Relations**: one-to-many and chained loaders built on the same batching
//!
//! ## Main Components
//!
//! - [`GatewayRuntime`]: process-wide owner of clients, cache and sink
//! - [`RequestLoaders`]: every loader for one gateway request
//! - [`ClientManager`]: connects and owns one [`BackendClient`] per service
//! - [`CacheInvalidator`]: exact and entity-wide cache eviction
//!
//! ## Example
//!
//! ```rust,no_run
//! use erp_gateway::{GatewayConfig, GatewayRuntime};
//!
//! #[tokio::main]
//! async fn main() -> erp_gateway::Result<()> {
//!     erp_gateway::init_logging("info");
//!
//!     let runtime = GatewayRuntime::builder()
//!         .config(GatewayConfig::from_env()?)
//!         .build()
//!         .await?;
//!
//!     let loaders = runtime.request_loaders();
//!     let (contact, leads) = tokio::join!(
//!         loaders.contacts().load("c1"),
//!         loaders.contact_leads().load("c1"),
//!     );
//!
//!     runtime.invalidator().invalidate_entity("contact", "c1").await;
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod dataloader;
pub mod error;
pub mod health;
pub mod invalidation;
pub mod loaders;
pub mod metrics;
pub mod observability;
pub mod registry;
pub mod relationships;
pub mod retry;
pub mod runtime;
pub mod stub;

pub use cache::{
    cache_store_from_config, CacheKey, CacheStore, MemoryCacheStore, RedisCacheStore,
    SharedCacheStore,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitState, SharedCircuitBreakerRegistry,
};
pub use client::{
    wrap_with_resilience, BackendClient, ClientManager, FallbackClient, ResilientClient,
    SharedClient,
};
pub use config::{
    BreakerSettings, CacheSettings, DiscoveryConfig, GatewayConfig, LoaderSettings, RetryConfig,
    ServiceOverride,
};
pub use dataloader::{Entity, EntityLoader, KeySpace, LoaderOptions};
pub use error::{Error, Result};
pub use health::{ComponentHealth, HealthResponse, HealthStatus};
pub use invalidation::{CacheInvalidator, InvalidationReport};
pub use loaders::RequestLoaders;
pub use metrics::{GatewayMetrics, GrpcTimer};
pub use observability::{
    init_logging, CacheEvent, CacheEventSink, SharedCacheEventSink, TracingSink,
};
pub use registry::{
    ConsulDiscovery, DiscoveryProvider, NoDiscovery, ServiceDescriptor, ServiceEndpoint,
    ServiceRegistry,
};
pub use relationships::{ChainedLoader, OneToManyLoader, RelationSpec, Related};
pub use retry::RetryPolicy;
pub use runtime::{GatewayRuntime, GatewayRuntimeBuilder};
pub use stub::{CallOptions, GrpcStub, GrpcStubConnector, ServiceStub, StubConnector};
