//! Gateway core configuration
//!
//! Loaded from YAML (every field has a default) and then adjusted by the
//! environment variables the deployment already sets for the gateway.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-service overrides on top of the built-in service table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOverride {
    /// Default `host:port` target used when discovery yields nothing
    pub address: Option<String>,
    /// Protobuf package, e.g. `crm`
    pub package: Option<String>,
    /// Protobuf service name, e.g. `CRMService`
    pub service: Option<String>,
    /// Name registered in the discovery provider
    pub discovery_name: Option<String>,
}

/// Service discovery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_consul_host")]
    pub consul_host: String,
    #[serde(default = "default_consul_port")]
    pub consul_port: u16,
    /// Upper bound on one discovery lookup
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_consul_host() -> String {
    "grpc-registry".to_string()
}

fn default_consul_port() -> u16 {
    8500
}

fn default_discovery_timeout_ms() -> u64 {
    5000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consul_host: default_consul_host(),
            consul_port: default_consul_port(),
            timeout_ms: default_discovery_timeout_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Circuit breaker settings shared by every backend service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_half_open_max_requests() -> u32 {
    1
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_max_requests: default_half_open_max_requests(),
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            half_open_max_requests: self.half_open_max_requests,
        }
    }
}

/// Retry settings for backend calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_backoff_base(Duration::from_millis(self.backoff_base_ms))
            .with_call_timeout(Duration::from_millis(self.call_timeout_ms))
    }
}

/// Shared cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Redis URL; the in-memory store is used when unset
    pub redis_url: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Bound for the in-memory store
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_max_entries() -> usize {
    100_000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Batching settings for the request-scoped loaders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderSettings {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_relationship_batch_size")]
    pub relationship_batch_size: usize,
    /// Length of the batch window
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

fn default_max_batch_size() -> usize {
    100
}

fn default_relationship_batch_size() -> usize {
    50
}

fn default_batch_delay_ms() -> u64 {
    1
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            relationship_batch_size: default_relationship_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

impl LoaderSettings {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Complete configuration of the gateway core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Overrides keyed by logical service name (`auth`, `crm`, ...)
    #[serde(default)]
    pub services: BTreeMap<String, ServiceOverride>,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub circuit_breaker: BreakerSettings,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub dataloader: LoaderSettings,

    /// Period of the background health probe; disabled when unset
    #[serde(default)]
    pub health_check_interval_secs: Option<u64>,

    /// Compiled `FileDescriptorSet` covering every backend service
    #[serde(default)]
    pub descriptor_set_path: Option<PathBuf>,
}

/// Environment variable → logical service whose default address it replaces
const SERVICE_ADDRESS_VARS: &[(&str, &str)] = &[
    ("GRPC_AUTH_SERVICE", "auth"),
    ("GRPC_CRM_SERVICE", "crm"),
    ("GRPC_HRM_SERVICE", "hrm"),
    ("GRPC_FINANCE_SERVICE", "finance"),
    ("GRPC_INVENTORY_SERVICE", "inventory"),
    ("GRPC_PROJECT_SERVICE", "projects"),
];

impl GatewayConfig {
    /// Parse configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Defaults adjusted by the process environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (var, service) in SERVICE_ADDRESS_VARS {
            if let Some(address) = lookup(var).filter(|v| !v.is_empty()) {
                self.services.entry(service.to_string()).or_default().address = Some(address);
            }
        }

        if let Some(host) = lookup("CONSUL_HOST").filter(|v| !v.is_empty()) {
            self.discovery.consul_host = host;
        }
        if let Some(port) = lookup("CONSUL_PORT") {
            self.discovery.consul_port = parse_var("CONSUL_PORT", &port)?;
        }
        if let Some(ttl) = lookup("DATALOADER_CACHE_TTL") {
            self.cache.ttl_secs = parse_var("DATALOADER_CACHE_TTL", &ttl)?;
        }
        if let Some(url) = lookup("REDIS_URL").filter(|v| !v.is_empty()) {
            self.cache.redis_url = Some(url);
        }

        Ok(())
    }

    /// Reject settings that would disable batching, retries or the breaker
    pub fn validate(&self) -> Result<()> {
        if self.dataloader.max_batch_size == 0 || self.dataloader.relationship_batch_size == 0 {
            return Err(Error::Config("batch sizes must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.cache.ttl_secs == 0 {
            return Err(Error::Config("cache.ttl_secs must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} has an invalid value: {:?}", name, value)))
}
