//! Resilient backend clients and the client manager
//!
//! [`wrap_with_resilience`] is the one decorator applied to every raw stub: it
//! gates calls on the service's circuit breaker, bounds each attempt with a
//! deadline and retries transient failures with exponential backoff. Callers
//! only see the [`BackendClient`] surface and cannot tell a live client from a
//! [`FallbackClient`] except by the errors it returns.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::health::{self, HealthResponse};
use crate::metrics::{GatewayMetrics, GrpcTimer};
use crate::registry::{DiscoveryProvider, ServiceRegistry};
use crate::retry::RetryPolicy;
use crate::stub::{CallOptions, ServiceStub, StubConnector};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tonic::Status;
use tracing::{debug, error, info, warn};

/// Call surface of one backend service as seen by the loaders
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Logical service name
    fn service(&self) -> &str;

    /// Invoke a remote method
    async fn call(&self, method: &str, request: serde_json::Value) -> Result<serde_json::Value>;

    /// Breaker state, if the client has one
    fn circuit_state(&self) -> Option<CircuitState>;

    /// Whether this client stands in for a service that failed to connect
    fn is_fallback(&self) -> bool {
        false
    }

    /// Release the connection
    async fn close(&self);
}

/// Shared client handle
pub type SharedClient = Arc<dyn BackendClient>;

/// A raw stub with breaker, deadline and retry applied
pub struct ResilientClient {
    service: String,
    stub: Arc<dyn ServiceStub>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

/// Wrap a raw stub in the resilience policy for its service
pub fn wrap_with_resilience(
    stub: Arc<dyn ServiceStub>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
) -> ResilientClient {
    ResilientClient {
        service: breaker.service_name().to_string(),
        stub,
        breaker,
        policy,
    }
}

impl ResilientClient {
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn attempt(
        &self,
        method: &str,
        request: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, Status> {
        let options = CallOptions {
            deadline: self.policy.call_timeout,
        };
        match tokio::time::timeout(
            self.policy.call_timeout,
            self.stub.invoke(method, request, options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Status::deadline_exceeded(format!(
                "{}.{} did not answer within {:?}",
                self.service, method, self.policy.call_timeout
            ))),
        }
    }
}

#[async_trait]
impl BackendClient for ResilientClient {
    fn service(&self) -> &str {
        &self.service
    }

    async fn call(&self, method: &str, request: serde_json::Value) -> Result<serde_json::Value> {
        if let Err(rejection) = self.breaker.allow_request() {
            GatewayMetrics::global().record_breaker_rejection(&self.service);
            return Err(rejection.into());
        }

        let mut failed_attempts = 0;
        loop {
            let timer = GrpcTimer::new(&self.service, method);
            let status = match self.attempt(method, request.clone()).await {
                Ok(response) => {
                    self.breaker.record_success();
                    return Ok(response);
                }
                Err(status) => status,
            };

            timer.record_error(&format!("{:?}", status.code()));
            self.breaker.record_failure();
            failed_attempts += 1;

            let err = Error::Grpc(status);
            if !err.is_retryable() || !self.policy.should_retry(failed_attempts) {
                debug!(
                    service = %self.service,
                    method = %method,
                    attempts = failed_attempts,
                    error = %err,
                    "Backend call failed"
                );
                return Err(err);
            }

            let backoff = self.policy.backoff_for(failed_attempts);
            warn!(
                service = %self.service,
                method = %method,
                attempt = failed_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Retrying backend call"
            );
            GatewayMetrics::global().record_retry(&self.service, method);
            tokio::time::sleep(backoff).await;
        }
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.breaker.state())
    }

    async fn close(&self) {
        self.stub.close().await;
    }
}

/// Stand-in for a service whose stub could not be built
#[derive(Debug, Clone)]
pub struct FallbackClient {
    service: String,
    reason: String,
}

impl FallbackClient {
    pub fn new(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[async_trait]
impl BackendClient for FallbackClient {
    fn service(&self) -> &str {
        &self.service
    }

    async fn call(&self, _method: &str, _request: serde_json::Value) -> Result<serde_json::Value> {
        Err(Error::ServiceUnavailable {
            service: self.service.clone(),
            reason: self.reason.clone(),
        })
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        None
    }

    fn is_fallback(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

/// Owns one client per backend service for the life of the process
pub struct ClientManager {
    clients: BTreeMap<String, SharedClient>,
    registry: ServiceRegistry,
    breakers: Arc<CircuitBreakerRegistry>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientManager {
    /// Connect every registered service.
    ///
    /// Services connect concurrently. A service whose stub cannot be built is
    /// served by a [`FallbackClient`] for the life of the process.
    pub async fn initialize(
        config: &GatewayConfig,
        registry: ServiceRegistry,
        discovery: &dyn DiscoveryProvider,
        connector: &dyn StubConnector,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.to_breaker_config(),
        ));
        let policy = config.retry.to_policy();

        let connects = registry.descriptors().map(|descriptor| {
            let registry = &registry;
            let breakers = &breakers;
            async move {
                let resolved = registry.resolve(&descriptor.name, discovery).await;
                let client: SharedClient = match resolved {
                    Ok(target) => match connector.connect(descriptor, &target).await {
                        Ok(stub) => {
                            info!(
                                service = %descriptor.name,
                                endpoint = %target,
                                "gRPC client connected"
                            );
                            Arc::new(wrap_with_resilience(
                                stub,
                                breakers.get_or_create(&descriptor.name),
                                policy,
                            ))
                        }
                        Err(e) => {
                            error!(
                                service = %descriptor.name,
                                error = %e,
                                "Failed to create gRPC client, using fallback"
                            );
                            Arc::new(FallbackClient::new(&descriptor.name, e.to_string()))
                        }
                    },
                    Err(e) => {
                        error!(
                            service = %descriptor.name,
                            error = %e,
                            "Failed to resolve service, using fallback"
                        );
                        Arc::new(FallbackClient::new(&descriptor.name, e.to_string()))
                    }
                };
                (descriptor.name.clone(), client)
            }
        });

        let clients = futures::future::join_all(connects).await.into_iter().collect();

        Self {
            clients,
            registry,
            breakers,
            health_task: Mutex::new(None),
        }
    }

    /// Build a manager around already-constructed clients
    pub fn from_clients(
        registry: ServiceRegistry,
        breakers: Arc<CircuitBreakerRegistry>,
        clients: impl IntoIterator<Item = SharedClient>,
    ) -> Self {
        let clients = clients
            .into_iter()
            .map(|client| (client.service().to_string(), client))
            .collect();
        Self {
            clients,
            registry,
            breakers,
            health_task: Mutex::new(None),
        }
    }

    pub fn get(&self, name: &str) -> Option<SharedClient> {
        self.clients.get(name).cloned()
    }

    /// Client for `name`, or a fallback when none is registered
    pub fn client(&self, name: &str) -> SharedClient {
        self.get(name).unwrap_or_else(|| {
            Arc::new(FallbackClient::new(name, "no client registered"))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Snapshot of every client's breaker state
    pub fn health(&self) -> HealthResponse {
        health::client_health(self.clients.values())
    }

    /// Start probing `HealthCheck` on every service that supports it.
    ///
    /// Replaces a probe task that is already running.
    pub fn start_health_checks(&self, interval: Duration) {
        let targets: Vec<SharedClient> = self
            .clients
            .values()
            .filter(|client| {
                self.registry
                    .get(client.service())
                    .map(|d| d.supports(crate::registry::HEALTH_CHECK_METHOD))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let handle = health::spawn_health_probe(targets, interval);
        if let Some(previous) = self.health_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the probe task and close every client
    pub async fn shutdown(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }

        for (name, client) in &self.clients {
            client.close().await;
            info!(service = %name, "Closed gRPC client");
        }
    }
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("services", &self.clients.keys().collect::<Vec<_>>())
            .field("breakers", &self.breakers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::registry::{NoDiscovery, ServiceDescriptor};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stub replaying scripted outcomes; repeats the last one when exhausted
    struct ScriptedStub {
        calls: AtomicUsize,
        script: Mutex<VecDeque<std::result::Result<serde_json::Value, Status>>>,
        last: Mutex<Option<std::result::Result<serde_json::Value, Status>>>,
        delay: Option<Duration>,
    }

    impl ScriptedStub {
        fn new(script: Vec<std::result::Result<serde_json::Value, Status>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                delay: None,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(VecDeque::new()),
                last: Mutex::new(Some(Ok(json!({})))),
                delay: Some(delay),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ServiceStub for ScriptedStub {
        async fn invoke(
            &self,
            _method: &str,
            _request: serde_json::Value,
            _options: CallOptions,
        ) -> std::result::Result<serde_json::Value, Status> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().pop_front();
            match next {
                Some(outcome) => {
                    *self.last.lock() = Some(outcome.clone());
                    outcome
                }
                None => self
                    .last
                    .lock()
                    .clone()
                    .unwrap_or_else(|| Err(Status::internal("script empty"))),
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3)
            .with_backoff_base(Duration::from_millis(1))
            .with_call_timeout(Duration::from_millis(200))
    }

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "crm",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(50),
                half_open_max_requests: 1,
            },
        ))
    }

    #[tokio::test]
    async fn test_success_passes_response_through() {
        let stub = ScriptedStub::new(vec![Ok(json!({"items": [{"id": "c1"}]}))]);
        let client = wrap_with_resilience(stub.clone(), breaker(5), fast_policy());

        let response = client.call("GetContactsByIds", json!({"ids": ["c1"]})).await.unwrap();
        assert_eq!(response, json!({"items": [{"id": "c1"}]}));
        assert_eq!(stub.calls(), 1);
        assert_eq!(client.circuit_state(), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_retryable_error_attempted_exactly_three_times() {
        let stub = ScriptedStub::new(vec![Err(Status::unavailable("down"))]);
        let client = wrap_with_resilience(stub.clone(), breaker(10), fast_policy());

        let err = client.call("GetContactsByIds", json!({})).await.unwrap_err();
        assert_eq!(err.grpc_code(), Some(tonic::Code::Unavailable));
        assert_eq!(stub.calls(), 3);
        assert_eq!(client.breaker().failure_count(), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let stub = ScriptedStub::new(vec![Err(Status::invalid_argument("bad id"))]);
        let client = wrap_with_resilience(stub.clone(), breaker(10), fast_policy());

        let err = client.call("GetContactsByIds", json!({})).await.unwrap_err();
        assert_eq!(err.grpc_code(), Some(tonic::Code::InvalidArgument));
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let stub = ScriptedStub::new(vec![
            Err(Status::resource_exhausted("busy")),
            Ok(json!({"ok": true})),
        ]);
        let client = wrap_with_resilience(stub.clone(), breaker(10), fast_policy());

        let response = client.call("GetContactsByIds", json!({})).await.unwrap();
        assert_eq!(response, json!({"ok": true}));
        assert_eq!(stub.calls(), 2);
        assert_eq!(client.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_maps_to_deadline_exceeded() {
        let stub = ScriptedStub::slow(Duration::from_millis(100));
        let policy = RetryPolicy::new(1).with_call_timeout(Duration::from_millis(10));
        let client = wrap_with_resilience(stub.clone(), breaker(10), policy);

        let err = client.call("GetContactsByIds", json!({})).await.unwrap_err();
        assert_eq!(err.grpc_code(), Some(tonic::Code::DeadlineExceeded));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_open_breaker_skips_stub() {
        let stub = ScriptedStub::new(vec![Err(Status::internal("boom"))]);
        let client = wrap_with_resilience(stub.clone(), breaker(2), fast_policy());

        assert!(client.call("GetContactsByIds", json!({})).await.is_err());
        assert!(client.call("GetContactsByIds", json!({})).await.is_err());
        assert_eq!(stub.calls(), 2);
        assert_eq!(client.circuit_state(), Some(CircuitState::Open));

        let err = client.call("GetContactsByIds", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { ref service, .. } if service == "crm"));
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn test_trial_after_cool_down_closes_breaker() {
        let stub = ScriptedStub::new(vec![Err(Status::internal("boom")), Ok(json!({}))]);
        let client = wrap_with_resilience(stub.clone(), breaker(1), fast_policy());

        assert!(client.call("GetContactsByIds", json!({})).await.is_err());
        assert!(client.call("GetContactsByIds", json!({})).await.is_err());
        assert_eq!(stub.calls(), 1);

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(client.call("GetContactsByIds", json!({})).await.is_ok());
        assert_eq!(stub.calls(), 2);
        assert_eq!(client.circuit_state(), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_dropped_trial_does_not_wedge_breaker() {
        let stub = ScriptedStub::slow(Duration::from_millis(100));
        let policy = RetryPolicy::new(3).with_call_timeout(Duration::from_secs(1));
        let client = wrap_with_resilience(stub.clone(), breaker(1), policy);

        client.breaker().record_failure();
        tokio::time::sleep(Duration::from_millis(70)).await;

        // The trial is cancelled by its caller before the stub answers
        let trial = tokio::time::timeout(
            Duration::from_millis(5),
            client.call("GetContactsByIds", json!({})),
        )
        .await;
        assert!(trial.is_err());
        assert_eq!(client.circuit_state(), Some(CircuitState::HalfOpen));

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(client.call("GetContactsByIds", json!({})).await.is_ok());
        assert_eq!(client.circuit_state(), Some(CircuitState::Closed));
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn test_fallback_client_fails_fast() {
        let client = FallbackClient::new("hrm", "descriptor missing");
        let err = client.call("GetEmployeesByIds", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "hrm service unavailable: descriptor missing");
        assert!(client.is_fallback());
        assert!(client.circuit_state().is_none());
    }

    struct SelectiveConnector {
        stub: Arc<ScriptedStub>,
        failing: &'static str,
    }

    #[async_trait]
    impl StubConnector for SelectiveConnector {
        async fn connect(
            &self,
            descriptor: &ServiceDescriptor,
            _target: &str,
        ) -> Result<Arc<dyn ServiceStub>> {
            if descriptor.name == self.failing {
                return Err(Error::Descriptor("not in descriptor set".to_string()));
            }
            Ok(self.stub.clone())
        }
    }

    #[tokio::test]
    async fn test_initialize_substitutes_fallback() {
        let config = GatewayConfig::default();
        let connector = SelectiveConnector {
            stub: ScriptedStub::new(vec![Ok(json!({"status": "SERVING"}))]),
            failing: "finance",
        };

        let manager = ClientManager::initialize(
            &config,
            ServiceRegistry::from_config(&config),
            &NoDiscovery,
            &connector,
        )
        .await;

        assert_eq!(manager.names().len(), 6);
        assert!(manager.get("finance").unwrap().is_fallback());
        assert!(!manager.get("crm").unwrap().is_fallback());
        assert!(manager.get("payroll").is_none());
        assert!(manager.client("payroll").is_fallback());

        let err = manager
            .client("finance")
            .call("GetInvoicesByIds", json!({"ids": ["i1"]}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SERVICE_UNAVAILABLE");

        let health = manager.health();
        assert_eq!(health.status, crate::health::HealthStatus::Unhealthy);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_breakers_are_per_service() {
        let config = GatewayConfig::default();
        let connector = SelectiveConnector {
            stub: ScriptedStub::new(vec![Err(Status::internal("boom"))]),
            failing: "",
        };
        let manager = ClientManager::initialize(
            &config,
            ServiceRegistry::from_config(&config),
            &NoDiscovery,
            &connector,
        )
        .await;

        let crm = manager.client("crm");
        for _ in 0..5 {
            let _ = crm.call("GetContactsByIds", json!({})).await;
        }
        assert_eq!(crm.circuit_state(), Some(CircuitState::Open));
        assert_eq!(
            manager.client("hrm").circuit_state(),
            Some(CircuitState::Closed)
        );
        assert_eq!(
            manager.breakers().status().get("crm"),
            Some(&CircuitState::Open)
        );
    }

    #[tokio::test]
    async fn test_health_checks_probe_and_stop() {
        let stub = ScriptedStub::new(vec![Ok(json!({"status": "SERVING"}))]);
        let config = GatewayConfig::default();
        let connector = SelectiveConnector {
            stub: stub.clone(),
            failing: "",
        };
        let manager = ClientManager::initialize(
            &config,
            ServiceRegistry::from_config(&config),
            &NoDiscovery,
            &connector,
        )
        .await;

        manager.start_health_checks(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(35)).await;
        manager.shutdown().await;

        let probed = stub.calls();
        assert!(probed >= 6, "every service probed at least once, got {probed}");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(stub.calls(), probed);
    }
}
