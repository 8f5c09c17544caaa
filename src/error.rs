//! Error types for the gateway client layer and data loaders

use std::time::Duration;
use thiserror::Error;
use tonic::Code;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway core
///
/// Covers backend failures, circuit-breaker rejections, cache and discovery
/// problems, and stub setup. Only a subset ever reaches callers of the
/// data loaders: loaders resolve failed batches to "not found" instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Backend call failed with a gRPC status
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// gRPC transport errors
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The service's circuit breaker rejected the call without contacting the backend
    #[error("Circuit breaker open for service '{service}'")]
    CircuitOpen {
        service: String,
        retry_after: Option<Duration>,
    },

    /// The service has no live client (connection setup failed at startup)
    #[error("{service} service unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    /// Protobuf descriptor errors (missing service or method, bad descriptor set)
    #[error("Descriptor error: {0}")]
    Descriptor(String),

    /// Service discovery errors
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Shared cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Redis errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a failed backend call may be retried.
    ///
    /// Only transient gRPC conditions qualify: `UNAVAILABLE`,
    /// `DEADLINE_EXCEEDED` and `RESOURCE_EXHAUSTED`. Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Grpc(status) => is_retryable_code(status.code()),
            _ => false,
        }
    }

    /// The gRPC status code carried by this error, if any
    pub fn grpc_code(&self) -> Option<Code> {
        match self {
            Error::Grpc(status) => Some(status.code()),
            _ => None,
        }
    }

    /// Stable error code used in metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            Error::Grpc(_) => "GRPC_ERROR",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Error::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            Error::Descriptor(_) => "DESCRIPTOR_ERROR",
            Error::Discovery(_) => "DISCOVERY_ERROR",
            Error::Cache(_) => "CACHE_ERROR",
            Error::Redis(_) => "CACHE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Yaml(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Retryable gRPC status codes
pub fn is_retryable_code(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted
    )
}

impl From<crate::circuit_breaker::CircuitBreakerError> for Error {
    fn from(err: crate::circuit_breaker::CircuitBreakerError) -> Self {
        match err {
            crate::circuit_breaker::CircuitBreakerError::CircuitOpen {
                service,
                retry_after,
            } => Error::CircuitOpen {
                service,
                retry_after,
            },
        }
    }
}
