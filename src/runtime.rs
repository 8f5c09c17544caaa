//! Process-wide gateway runtime
//!
//! [`GatewayRuntime`] is built once at startup and shared by reference with
//! every request. It owns the backend clients (and through them the circuit
//! breakers), the shared cache and the cache event sink. Request-scoped state
//! lives in the [`RequestLoaders`] it hands out.

use crate::cache::{cache_store_from_config, SharedCacheStore};
use crate::client::ClientManager;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::health::HealthResponse;
use crate::invalidation::CacheInvalidator;
use crate::loaders::RequestLoaders;
use crate::observability::{SharedCacheEventSink, TracingSink};
use crate::registry::{discovery_from_config, DiscoveryProvider, ServiceRegistry};
use crate::stub::{GrpcStubConnector, StubConnector};
use std::sync::Arc;
use tracing::info;

/// Shared state of a running gateway
#[derive(Clone)]
pub struct GatewayRuntime {
    config: Arc<GatewayConfig>,
    clients: Arc<ClientManager>,
    cache: SharedCacheStore,
    sink: SharedCacheEventSink,
    invalidator: CacheInvalidator,
}

impl GatewayRuntime {
    /// Create a new runtime builder
    pub fn builder() -> GatewayRuntimeBuilder {
        GatewayRuntimeBuilder::new()
    }

    /// Assemble a runtime from already-built parts
    pub fn from_parts(
        config: GatewayConfig,
        clients: ClientManager,
        cache: SharedCacheStore,
        sink: SharedCacheEventSink,
    ) -> Self {
        let invalidator = CacheInvalidator::with_catalog(cache.clone(), sink.clone());
        Self {
            config: Arc::new(config),
            clients: Arc::new(clients),
            cache,
            sink,
            invalidator,
        }
    }

    /// Fresh loaders for one gateway request
    pub fn request_loaders(&self) -> RequestLoaders {
        RequestLoaders::new(
            &self.clients,
            self.cache.clone(),
            self.sink.clone(),
            &self.config.dataloader,
            &self.config.cache,
        )
    }

    pub fn invalidator(&self) -> &CacheInvalidator {
        &self.invalidator
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> &SharedCacheStore {
        &self.cache
    }

    /// Breaker-derived health of every backend
    pub fn health(&self) -> HealthResponse {
        self.clients.health()
    }

    /// Stop the health probe and close every client
    pub async fn shutdown(&self) {
        info!("Shutting down gateway runtime");
        self.clients.shutdown().await;
    }
}

impl std::fmt::Debug for GatewayRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRuntime")
            .field("clients", &self.clients)
            .field("invalidator", &self.invalidator)
            .finish()
    }
}

/// Builder for [`GatewayRuntime`]
///
/// Anything not supplied is derived from the configuration: Consul discovery
/// when enabled, a gRPC connector over `descriptor_set_path`, Redis when
/// `redis_url` is set and an in-memory store otherwise.
#[derive(Default)]
pub struct GatewayRuntimeBuilder {
    config: Option<GatewayConfig>,
    registry: Option<ServiceRegistry>,
    discovery: Option<Arc<dyn DiscoveryProvider>>,
    connector: Option<Arc<dyn StubConnector>>,
    cache: Option<SharedCacheStore>,
    sink: Option<SharedCacheEventSink>,
}

impl GatewayRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the service table derived from the configuration
    pub fn registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn DiscoveryProvider>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn StubConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn cache_store(mut self, cache: SharedCacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn sink(mut self, sink: SharedCacheEventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration, connect every service and start health checks
    pub async fn build(self) -> Result<GatewayRuntime> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let registry = match self.registry {
            Some(registry) => registry,
            None => ServiceRegistry::from_config(&config),
        };
        let discovery = match self.discovery {
            Some(discovery) => discovery,
            None => discovery_from_config(&config.discovery)?,
        };
        let connector: Arc<dyn StubConnector> = match self.connector {
            Some(connector) => connector,
            None => match &config.descriptor_set_path {
                Some(path) => Arc::new(GrpcStubConnector::from_file(path)?),
                None => Arc::new(GrpcStubConnector::empty()),
            },
        };
        let cache = match self.cache {
            Some(cache) => cache,
            None => cache_store_from_config(&config.cache).await?,
        };
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));

        let clients =
            ClientManager::initialize(&config, registry, discovery.as_ref(), connector.as_ref())
                .await;
        if let Some(interval) = config.health_check_interval() {
            clients.start_health_checks(interval);
        }

        info!(services = ?clients.names(), "Gateway runtime ready");
        Ok(GatewayRuntime::from_parts(config, clients, cache, sink))
    }
}
