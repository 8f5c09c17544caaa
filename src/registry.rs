//! Backend service table and service discovery
//!
//! Six backend services are known to the gateway. Each has a default target,
//! the name it registers under in Consul, and the set of remote methods the
//! gateway calls on it. At connection time a service's target is looked up
//! through a [`DiscoveryProvider`]; any discovery problem falls back to the
//! default target.

use crate::config::{DiscoveryConfig, GatewayConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Method every backend exposes for liveness probing
pub const HEALTH_CHECK_METHOD: &str = "HealthCheck";

struct BuiltinService {
    name: &'static str,
    package: &'static str,
    service: &'static str,
    address: &'static str,
    methods: &'static [&'static str],
}

const BUILTIN_SERVICES: &[BuiltinService] = &[
    BuiltinService {
        name: "auth",
        package: "auth",
        service: "AuthService",
        address: "auth-service:50051",
        methods: &[
            "GetUsersByIds",
            "GetUserProfilesByIds",
            "GetUserPermissionsByIds",
        ],
    },
    BuiltinService {
        name: "crm",
        package: "crm",
        service: "CRMService",
        address: "crm-service:50052",
        methods: &[
            "GetContactsByIds",
            "GetLeadsByIds",
            "GetOpportunitiesByIds",
            "GetActivitiesByIds",
            "GetLeadsByContactIds",
        ],
    },
    BuiltinService {
        name: "hrm",
        package: "hrm",
        service: "HRMService",
        address: "hrm-service:50053",
        methods: &[
            "GetEmployeesByIds",
            "GetDepartmentsByIds",
            "GetLeavesByIds",
            "GetTimesheetsByIds",
        ],
    },
    BuiltinService {
        name: "finance",
        package: "finance",
        service: "FinanceService",
        address: "finance-service:50054",
        methods: &[
            "GetInvoicesByIds",
            "GetPaymentsByIds",
            "GetInvoiceLineItemsByIds",
            "GetInvoiceLineItemsByInvoiceIds",
        ],
    },
    BuiltinService {
        name: "inventory",
        package: "inventory",
        service: "InventoryService",
        address: "inventory-service:50055",
        methods: &[
            "GetProductsByIds",
            "GetCategoriesByIds",
            "GetSuppliersByIds",
            "GetStockMovementsByIds",
            "GetStockMovementsByProductIds",
        ],
    },
    BuiltinService {
        name: "projects",
        package: "projects",
        service: "ProjectService",
        address: "project-service:50056",
        methods: &[],
    },
];

/// Static description of one backend service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Logical name used throughout the gateway (`crm`, `hrm`, ...)
    pub name: String,
    /// Protobuf package
    pub package: String,
    /// Protobuf service name inside the package
    pub service: String,
    /// `host:port` used when discovery yields nothing
    pub default_target: String,
    /// Name queried in the discovery provider
    pub discovery_query: String,
    /// Remote methods the gateway calls on this service
    pub capabilities: BTreeSet<String>,
}

impl ServiceDescriptor {
    /// Fully qualified protobuf service name, e.g. `crm.CRMService`
    pub fn full_service_name(&self) -> String {
        if self.package.is_empty() {
            self.service.clone()
        } else {
            format!("{}.{}", self.package, self.service)
        }
    }

    pub fn supports(&self, method: &str) -> bool {
        self.capabilities.contains(method)
    }

    /// Default target as a connectable URI
    pub fn default_uri(&self) -> String {
        with_scheme(&self.default_target)
    }
}

/// One instance returned by a discovery provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub address: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn uri(&self) -> String {
        with_scheme(&format!("{}:{}", self.address, self.port))
    }
}

fn with_scheme(target: &str) -> String {
    if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{}", target)
    }
}

/// Source of live service instances
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Healthy instances registered under `query`
    async fn lookup(&self, query: &str) -> Result<Vec<ServiceEndpoint>>;
}

/// Discovery disabled: every lookup is empty
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiscovery;

#[async_trait]
impl DiscoveryProvider for NoDiscovery {
    async fn lookup(&self, _query: &str) -> Result<Vec<ServiceEndpoint>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct ConsulHealthEntry {
    #[serde(rename = "Service")]
    service: ConsulService,
}

#[derive(Debug, Deserialize)]
struct ConsulService {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
}

/// Consul health API client
#[derive(Debug, Clone)]
pub struct ConsulDiscovery {
    base_url: String,
    client: reqwest::Client,
}

impl ConsulDiscovery {
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Discovery(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: format!("http://{}:{}", config.consul_host, config.consul_port),
            client,
        })
    }
}

#[async_trait]
impl DiscoveryProvider for ConsulDiscovery {
    async fn lookup(&self, query: &str) -> Result<Vec<ServiceEndpoint>> {
        let url = format!("{}/v1/health/service/{}", self.base_url, query);
        debug!(url = %url, "Querying Consul");

        let response = self
            .client
            .get(&url)
            .query(&[("passing", "true")])
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("Consul request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::Discovery(format!("Consul returned an error: {}", e)))?;

        let entries: Vec<ConsulHealthEntry> = response
            .json()
            .await
            .map_err(|e| Error::Discovery(format!("Invalid Consul response: {}", e)))?;

        Ok(entries
            .into_iter()
            .map(|entry| ServiceEndpoint {
                address: entry.service.address,
                port: entry.service.port,
            })
            .collect())
    }
}

/// Build the discovery provider described by the configuration
pub fn discovery_from_config(config: &DiscoveryConfig) -> Result<Arc<dyn DiscoveryProvider>> {
    if config.enabled {
        Ok(Arc::new(ConsulDiscovery::new(config)?))
    } else {
        Ok(Arc::new(NoDiscovery))
    }
}

/// Table of backend services known to the gateway
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceDescriptor>,
    discovery_timeout: Duration,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

impl ServiceRegistry {
    /// Built-in table with the configured overrides applied
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut services = BTreeMap::new();

        for builtin in BUILTIN_SERVICES {
            let mut descriptor = ServiceDescriptor {
                name: builtin.name.to_string(),
                package: builtin.package.to_string(),
                service: builtin.service.to_string(),
                default_target: builtin.address.to_string(),
                discovery_query: format!("erp-{}-service", builtin.name),
                capabilities: builtin
                    .methods
                    .iter()
                    .chain(std::iter::once(&HEALTH_CHECK_METHOD))
                    .map(|m| m.to_string())
                    .collect(),
            };

            if let Some(overrides) = config.services.get(builtin.name) {
                if let Some(address) = &overrides.address {
                    descriptor.default_target = address.clone();
                }
                if let Some(package) = &overrides.package {
                    descriptor.package = package.clone();
                }
                if let Some(service) = &overrides.service {
                    descriptor.service = service.clone();
                }
                if let Some(discovery_name) = &overrides.discovery_name {
                    descriptor.discovery_query = discovery_name.clone();
                }
            }

            services.insert(descriptor.name.clone(), descriptor);
        }

        for name in config.services.keys() {
            if !services.contains_key(name) {
                warn!(service = %name, "Ignoring override for unknown service");
            }
        }

        Self {
            services,
            discovery_timeout: config.discovery.timeout(),
        }
    }

    /// Replace the bound on discovery lookups
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    /// Resolve a logical service name to a connectable URI.
    ///
    /// Discovery is bounded by the configured timeout. Among several healthy
    /// instances one is picked at random. Zero instances, a lookup error or a
    /// timeout all resolve to the service's default target.
    pub async fn resolve(&self, name: &str, provider: &dyn DiscoveryProvider) -> Result<String> {
        let descriptor = self
            .get(name)
            .ok_or_else(|| Error::Config(format!("Unknown service '{}'", name)))?;

        let lookup = tokio::time::timeout(
            self.discovery_timeout,
            provider.lookup(&descriptor.discovery_query),
        )
        .await;

        match lookup {
            Ok(Ok(endpoints)) => {
                let picked = endpoints.choose(&mut rand::thread_rng()).cloned();
                if let Some(endpoint) = picked {
                    let uri = endpoint.uri();
                    info!(service = %name, endpoint = %uri, "Service discovery found instance");
                    return Ok(uri);
                }
                warn!(
                    service = %name,
                    query = %descriptor.discovery_query,
                    "Service discovery returned no instances, using default address"
                );
            }
            Ok(Err(e)) => {
                warn!(
                    service = %name,
                    error = %e,
                    "Service discovery failed, using default address"
                );
            }
            Err(_) => {
                warn!(
                    service = %name,
                    timeout_ms = self.discovery_timeout.as_millis() as u64,
                    "Service discovery timed out, using default address"
                );
            }
        }

        Ok(descriptor.default_uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceOverride;

    struct StaticDiscovery(Vec<ServiceEndpoint>);

    #[async_trait]
    impl DiscoveryProvider for StaticDiscovery {
        async fn lookup(&self, _query: &str) -> Result<Vec<ServiceEndpoint>> {
            Ok(self.0.clone())
        }
    }

    struct FailingDiscovery;

    #[async_trait]
    impl DiscoveryProvider for FailingDiscovery {
        async fn lookup(&self, _query: &str) -> Result<Vec<ServiceEndpoint>> {
            Err(Error::Discovery("connection refused".to_string()))
        }
    }

    struct HangingDiscovery;

    #[async_trait]
    impl DiscoveryProvider for HangingDiscovery {
        async fn lookup(&self, _query: &str) -> Result<Vec<ServiceEndpoint>> {
            futures::future::pending().await
        }
    }

    #[test]
    fn test_builtin_table() {
        let registry = ServiceRegistry::default();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["auth", "crm", "finance", "hrm", "inventory", "projects"]);

        let crm = registry.get("crm").unwrap();
        assert_eq!(crm.full_service_name(), "crm.CRMService");
        assert_eq!(crm.default_target, "crm-service:50052");
        assert_eq!(crm.discovery_query, "erp-crm-service");
        assert!(crm.supports("GetLeadsByContactIds"));
        assert!(crm.supports(HEALTH_CHECK_METHOD));
        assert!(!crm.supports("GetInvoicesByIds"));

        let projects = registry.get("projects").unwrap();
        assert_eq!(projects.default_uri(), "http://project-service:50056");
    }

    #[test]
    fn test_overrides() {
        let mut config = GatewayConfig::default();
        config.services.insert(
            "finance".to_string(),
            ServiceOverride {
                address: Some("http://localhost:7054".to_string()),
                discovery_name: Some("billing".to_string()),
                ..Default::default()
            },
        );
        let registry = ServiceRegistry::from_config(&config);
        let finance = registry.get("finance").unwrap();
        assert_eq!(finance.default_uri(), "http://localhost:7054");
        assert_eq!(finance.discovery_query, "billing");
        assert_eq!(finance.service, "FinanceService");
    }

    #[tokio::test]
    async fn test_resolve_picks_discovered_instance() {
        let registry = ServiceRegistry::default();
        let provider = StaticDiscovery(vec![
            ServiceEndpoint {
                address: "10.0.0.1".to_string(),
                port: 6000,
            },
            ServiceEndpoint {
                address: "10.0.0.2".to_string(),
                port: 6000,
            },
        ]);

        let uri = registry.resolve("hrm", &provider).await.unwrap();
        assert!(uri == "http://10.0.0.1:6000" || uri == "http://10.0.0.2:6000");
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_default() {
        let registry = ServiceRegistry::default();

        let uri = registry.resolve("auth", &NoDiscovery).await.unwrap();
        assert_eq!(uri, "http://auth-service:50051");

        let uri = registry.resolve("auth", &FailingDiscovery).await.unwrap();
        assert_eq!(uri, "http://auth-service:50051");
    }

    #[tokio::test]
    async fn test_resolve_timeout_falls_back() {
        let registry =
            ServiceRegistry::default().with_discovery_timeout(Duration::from_millis(20));
        let uri = registry.resolve("inventory", &HangingDiscovery).await.unwrap();
        assert_eq!(uri, "http://inventory-service:50055");
    }

    #[tokio::test]
    async fn test_resolve_unknown_service() {
        let registry = ServiceRegistry::default();
        let err = registry.resolve("payroll", &NoDiscovery).await.unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_discovery_from_config() {
        let config = DiscoveryConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(discovery_from_config(&config).is_ok());
        assert!(discovery_from_config(&DiscoveryConfig::default()).is_ok());
    }
}
