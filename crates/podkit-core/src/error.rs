//! Transport-level and configuration error types.

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors that can occur while talking to a pod node.
///
/// `Clone` so one failure can be handed to every waiter of a shared
/// operation (single-flight refreshes, all consumers of a subscription).
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The node could not be reached (connection refused, 5xx, reset).
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The node answered with data that fails its decode/validate contract.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The socket dropped while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// The connection was shut down; no further work is accepted.
    #[error("connection closed")]
    ConnectionClosed,

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out after the configured duration.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if this error is transient and worth retrying under backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable(_) | Self::ConnectionLost | Self::Timeout { .. }
        )
    }

    /// Returns `true` if the node sent something that violates the wire contract.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedResponse(_))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedResponse(e.to_string())
    }
}

/// Invalid configuration values or unreadable config files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
