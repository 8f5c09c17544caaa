//! Backend health reporting.
//!
//! Two views of backend health are available:
//!
//! - a snapshot derived from each client's circuit breaker (no network traffic)
//! - a periodic probe calling `HealthCheck` on every service that exposes it
//!
//! Breaker state maps onto health as follows: CLOSED is healthy, HALF_OPEN is
//! degraded, OPEN and fallback clients are unhealthy.

use crate::circuit_breaker::CircuitState;
use crate::client::SharedClient;
use crate::registry::HEALTH_CHECK_METHOD;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall health status
    pub status: HealthStatus,
    /// Optional message with details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Individual component checks
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub checks: Vec<ComponentHealth>,
}

/// Health status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Service is healthy
    Healthy,
    /// Service is degraded but operational
    Degraded,
    /// Service is unhealthy
    Unhealthy,
}

/// Individual component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Component health status
    pub status: HealthStatus,
    /// Optional message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    /// Health of one backend client, from its breaker state
    pub fn for_client(client: &SharedClient) -> Self {
        let (status, message) = if client.is_fallback() {
            (HealthStatus::Unhealthy, "fallback client".to_string())
        } else {
            match client.circuit_state() {
                Some(CircuitState::Closed) | None => {
                    (HealthStatus::Healthy, "circuit CLOSED".to_string())
                }
                Some(CircuitState::HalfOpen) => {
                    (HealthStatus::Degraded, "circuit HALF_OPEN".to_string())
                }
                Some(CircuitState::Open) => (HealthStatus::Unhealthy, "circuit OPEN".to_string()),
            }
        };

        Self {
            name: client.service().to_string(),
            status,
            message: Some(message),
        }
    }
}

impl HealthResponse {
    /// Create a healthy response
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            checks: Vec::new(),
        }
    }

    /// Add a component check; the overall status becomes the worst seen
    pub fn with_check(mut self, check: ComponentHealth) -> Self {
        match (&self.status, check.status) {
            (HealthStatus::Healthy, HealthStatus::Unhealthy) => {
                self.status = HealthStatus::Unhealthy;
            }
            (HealthStatus::Healthy, HealthStatus::Degraded) => {
                self.status = HealthStatus::Degraded;
            }
            (HealthStatus::Degraded, HealthStatus::Unhealthy) => {
                self.status = HealthStatus::Unhealthy;
            }
            _ => {}
        }
        self.checks.push(check);
        self
    }
}

/// Snapshot of a set of clients
pub fn client_health<'a>(clients: impl IntoIterator<Item = &'a SharedClient>) -> HealthResponse {
    let mut response = HealthResponse::healthy();
    let mut count = 0;
    for client in clients {
        response = response.with_check(ComponentHealth::for_client(client));
        count += 1;
    }
    if count == 0 {
        response.status = HealthStatus::Degraded;
        response.message = Some("No backend clients configured".to_string());
    }
    response
}

/// Call `HealthCheck` on each client once and log the outcome
pub async fn probe_once(clients: &[SharedClient]) -> Vec<(String, bool)> {
    let probes = clients.iter().map(|client| async move {
        let healthy = match client.call(HEALTH_CHECK_METHOD, serde_json::json!({})).await {
            Ok(_) => {
                info!(service = %client.service(), "Backend service healthy");
                true
            }
            Err(e) => {
                warn!(service = %client.service(), error = %e, "Health check failed");
                false
            }
        };
        (client.service().to_string(), healthy)
    });
    futures::future::join_all(probes).await
}

/// Probe `clients` every `interval` until the task is aborted
pub fn spawn_health_probe(clients: Vec<SharedClient>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            probe_once(&clients).await;
        }
    })
}
