//! Gateway error taxonomy: kinds, not types — every fallible public operation
//! returns one of these variants.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("backend '{0}' not found")]
    BackendNotFound(String),

    #[error("backend '{0}' already exists")]
    BackendAlreadyExists(String),

    #[error("no healthy backends available for tool '{tool_name}'")]
    NoHealthyBackends { tool_name: String },

    #[error("routing failed for tool '{tool_name}': {reason}")]
    Routing { tool_name: String, reason: String },

    #[error("circuit breaker open for backend '{backend_name}'")]
    CircuitBreakerOpen { backend_name: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("process management failed: {0}")]
    ProcessManagement(String),

    #[error("configuration watch failed: {0}")]
    ConfigurationWatch(String),

    #[error("transport error talking to backend '{backend_name}': {source}")]
    Transport {
        backend_name: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Whether this kind is ever retried by the routed invocation loop.
    /// Routing/Circuit/NotFound errors are never retried; only Transport is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transport { .. })
    }
}
