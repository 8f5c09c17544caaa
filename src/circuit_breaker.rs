//! Circuit Breaker pattern for gRPC backend resilience
//!
//! The Circuit Breaker stops the gateway from calling a backend service that
//! keeps failing, giving it a cool-down period to recover. There is exactly one
//! breaker per backend service; a failing service never trips another
//! service's breaker.
//!
//! ## States
//!
//! - **Closed**: Normal operation, requests flow through
//! - **Open**: Service unhealthy, requests fail fast without calling backend
//! - **Half-Open**: Cool-down elapsed, a single trial request is let through
//!
//! ## How It Works
//!
//! 1. Circuit starts **Closed** - all requests go through
//! 2. After `failure_threshold` consecutive failures → Circuit **Opens**
//! 3. `recovery_timeout` after the last recorded failure → Circuit becomes **Half-Open**
//! 4. If the trial succeeds → Circuit **Closes** and the failure count resets
//! 5. If the trial fails → Circuit **Opens** again with a fresh failure timestamp
//!
//! ## Example
//!
//! ```rust
//! use erp_gateway::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//!
//! let breaker = CircuitBreaker::new("crm", CircuitBreakerConfig::default());
//! assert!(breaker.allow_request().is_ok());
//! for _ in 0..5 {
//!     breaker.record_failure();
//! }
//! assert_eq!(breaker.state(), CircuitState::Open);
//! assert!(breaker.allow_request().is_err());
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast until the cool-down elapses
    Open,
    /// A trial call decides the next state
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for the Circuit Breaker
///
/// # Example
///
/// ```rust
/// use erp_gateway::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig {
///     failure_threshold: 5,                      // Open after 5 failures
///     recovery_timeout: Duration::from_secs(60), // Trial call 60s after the last failure
///     half_open_max_requests: 1,                 // One trial at a time
/// };
/// ```
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Cool-down measured from the last recorded failure
    pub recovery_timeout: Duration,
    /// Trial requests let through while Half-Open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_requests: 1,
        }
    }
}

/// Circuit breaker for a single service
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    /// Consecutive failure count
    failure_count: AtomicU32,
    /// Last failure as millis since UNIX_EPOCH (0 = never)
    last_failure_at: AtomicU64,
    /// Trial requests handed out in the current Half-Open period
    half_open_requests: AtomicU32,
    /// Admission of the latest trial as millis since UNIX_EPOCH
    trial_admitted_at: AtomicU64,
    service_name: String,
}

impl CircuitBreaker {
    /// Breaker for `service_name`, starting CLOSED
    pub fn new(service_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            last_failure_at: AtomicU64::new(0),
            half_open_requests: AtomicU32::new(0),
            trial_admitted_at: AtomicU64::new(0),
            service_name: service_name.into(),
        }
    }

    /// Current state, without handing out a trial slot.
    ///
    /// An Open circuit whose cool-down has elapsed is reported as Half-Open.
    pub fn state(&self) -> CircuitState {
        let state = *self.state.read();
        if state == CircuitState::Open && self.cool_down_elapsed() {
            return CircuitState::HalfOpen;
        }
        state
    }

    /// Gate one logical call
    ///
    /// While OPEN and cooling down this fails with [`CircuitBreakerError::CircuitOpen`].
    /// Once the cool-down has elapsed, trial calls are admitted in HALF_OPEN.
    /// The first request after the cool-down flips the circuit to Half-Open and
    /// becomes the trial. A trial that never reports back (its caller dropped
    /// the call) stops holding its slot once `recovery_timeout` has passed
    /// since it was admitted.
    pub fn allow_request(&self) -> Result<(), CircuitBreakerError> {
        self.maybe_transition_to_half_open();

        let state = *self.state.read();
        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                tracing::debug!(
                    service = %self.service_name,
                    "Circuit open, failing fast"
                );
                Err(CircuitBreakerError::CircuitOpen {
                    service: self.service_name.clone(),
                    retry_after: self.time_until_half_open(),
                })
            }
            CircuitState::HalfOpen => {
                if self.trial_abandoned() {
                    tracing::debug!(
                        service = %self.service_name,
                        "Trial request never settled, admitting another"
                    );
                    self.half_open_requests.store(0, Ordering::SeqCst);
                }

                let current = self.half_open_requests.fetch_add(1, Ordering::SeqCst);
                if current < self.config.half_open_max_requests {
                    self.trial_admitted_at.store(now_millis(), Ordering::SeqCst);
                    tracing::debug!(
                        service = %self.service_name,
                        trial = current + 1,
                        "Circuit breaker HALF-OPEN - allowing trial request"
                    );
                    Ok(())
                } else {
                    Err(CircuitBreakerError::CircuitOpen {
                        service: self.service_name.clone(),
                        retry_after: Some(self.config.recovery_timeout),
                    })
                }
            }
        }
    }

    /// Record a successful request: failure count to zero, state to Closed
    pub fn record_success(&self) {
        let previous = {
            let mut state = self.state.write();
            let previous = *state;
            *state = CircuitState::Closed;
            previous
        };
        self.failure_count.store(0, Ordering::SeqCst);
        self.half_open_requests.store(0, Ordering::SeqCst);

        if previous != CircuitState::Closed {
            tracing::info!(
                service = %self.service_name,
                "Circuit breaker CLOSED - service recovered"
            );
        }
    }

    /// Count a failed call; may open or reopen the circuit
    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.last_failure_at.store(now_millis(), Ordering::SeqCst);

        let mut state = self.state.write();
        match *state {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    *state = CircuitState::Open;
                    tracing::warn!(
                        service = %self.service_name,
                        failures = failures,
                        "Failure threshold reached, opening circuit"
                    );
                }
            }
            CircuitState::HalfOpen => {
                *state = CircuitState::Open;
                self.half_open_requests.store(0, Ordering::SeqCst);
                tracing::warn!(
                    service = %self.service_name,
                    "Circuit breaker REOPENED - trial request failed"
                );
            }
            // Timestamp refreshed above; cool-down restarts
            CircuitState::Open => {}
        }
    }

    /// Get the service name
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Get failure count
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn maybe_transition_to_half_open(&self) {
        if *self.state.read() != CircuitState::Open || !self.cool_down_elapsed() {
            return;
        }

        let mut state = self.state.write();
        if *state == CircuitState::Open {
            *state = CircuitState::HalfOpen;
            self.half_open_requests.store(0, Ordering::SeqCst);
            tracing::info!(
                service = %self.service_name,
                "Circuit breaker HALF-OPEN - testing recovery"
            );
        }
    }

    fn trial_abandoned(&self) -> bool {
        if self.half_open_requests.load(Ordering::SeqCst) < self.config.half_open_max_requests {
            return false;
        }
        let admitted = self.trial_admitted_at.load(Ordering::SeqCst);
        Duration::from_millis(now_millis().saturating_sub(admitted)) >= self.config.recovery_timeout
    }

    fn elapsed_since_failure(&self) -> Duration {
        let last = self.last_failure_at.load(Ordering::SeqCst);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    fn cool_down_elapsed(&self) -> bool {
        self.elapsed_since_failure() >= self.config.recovery_timeout
    }

    fn time_until_half_open(&self) -> Option<Duration> {
        self.config
            .recovery_timeout
            .checked_sub(self.elapsed_since_failure())
    }

    /// Back to CLOSED with no recorded failures
    pub fn reset(&self) {
        *self.state.write() = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        self.half_open_requests.store(0, Ordering::SeqCst);
        tracing::info!(
            service = %self.service_name,
            "Circuit reset"
        );
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service_name)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

/// Registry of circuit breakers, one per backend service
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Registry handing out breakers with `config`
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for `service_name`, created on first use
    pub fn get_or_create(&self, service_name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(service_name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service_name, self.config.clone())))
            .clone()
    }

    /// Existing breaker for `service_name`
    pub fn get(&self, service_name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(service_name).cloned()
    }

    /// Current state of every breaker
    pub fn status(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.state()))
            .collect()
    }

    /// Close every breaker
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("services", &self.breakers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Shared circuit breaker registry
pub type SharedCircuitBreakerRegistry = Arc<CircuitBreakerRegistry>;

/// Error types for circuit breaker
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitBreakerError {
    /// The breaker rejected the call without contacting the backend
    #[error("Circuit breaker open for service '{service}'. Retry after {retry_after:?}")]
    CircuitOpen {
        service: String,
        retry_after: Option<Duration>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(20),
            half_open_max_requests: 1,
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout, Duration::from_secs(60));
        assert_eq!(config.half_open_max_requests, 1);
    }

    #[test]
    fn test_circuit_opens_at_threshold() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());

        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        match cb.allow_request() {
            Err(CircuitBreakerError::CircuitOpen {
                service,
                retry_after,
            }) => {
                assert_eq!(service, "test");
                assert!(retry_after.is_some());
            }
            Ok(()) => panic!("open circuit must reject"),
        }
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", fast_config(3));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        // Count restarted, so two more failures keep it closed
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_exactly_one_trial_after_cool_down() {
        let cb = CircuitBreaker::new("test", fast_config(1));

        cb.record_failure();
        assert!(cb.allow_request().is_err());

        std::thread::sleep(Duration::from_millis(30));

        assert!(cb.allow_request().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Trial still outstanding
        assert!(cb.allow_request().is_err());
    }

    #[test]
    fn test_half_open_success_closes() {
        let cb = CircuitBreaker::new("test", fast_config(1));

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow_request().is_ok());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.allow_request().is_ok());
    }

    #[test]
    fn test_half_open_failure_reopens_with_fresh_timestamp() {
        let cb = CircuitBreaker::new("test", fast_config(1));

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow_request().is_ok());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.allow_request().is_err());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow_request().is_ok());
    }

    #[test]
    fn test_failures_while_open_extend_cool_down() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                recovery_timeout: Duration::from_millis(200),
                ..fast_config(1)
            },
        );
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(120));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(120));
        // 240ms since the first failure but only 120ms since the last one
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_unsettled_trial_is_replaced_after_cool_down() {
        let cb = CircuitBreaker::new("test", fast_config(1));

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        // Trial admitted, then its caller goes away without reporting
        assert!(cb.allow_request().is_ok());
        assert!(cb.allow_request().is_err());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow_request().is_ok());
        assert!(cb.allow_request().is_err());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_manual_reset() {
        let cb = CircuitBreaker::new("test", fast_config(1));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request().is_ok());
    }

    #[test]
    fn test_registry_isolates_services() {
        let registry = CircuitBreakerRegistry::new(fast_config(1));

        let crm = registry.get_or_create("crm");
        let hrm = registry.get_or_create("hrm");
        assert!(Arc::ptr_eq(&crm, &registry.get_or_create("crm")));
        assert!(!Arc::ptr_eq(&crm, &hrm));

        crm.record_failure();

        let status = registry.status();
        assert_eq!(status.get("crm"), Some(&CircuitState::Open));
        assert_eq!(status.get("hrm"), Some(&CircuitState::Closed));
        assert!(hrm.allow_request().is_ok());

        registry.reset_all();
        assert_eq!(crm.state(), CircuitState::Closed);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
    }
}
