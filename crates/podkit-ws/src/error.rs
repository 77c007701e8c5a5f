//! Subscription-layer errors.

use podkit_core::TransportError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum WsError {
    /// Socket-level failure, including `ConnectionLost` and `ConnectionClosed`.
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("subscription limit reached ({max} active)")]
    SubscriptionLimit { max: usize },

    #[error("invalid params for channel `{channel}`: {reason}")]
    InvalidParams { channel: String, reason: String },

    /// The node rejected the request.
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },
}

impl WsError {
    pub(crate) fn closed() -> Self {
        Self::Transport(TransportError::ConnectionClosed)
    }

    pub(crate) fn lost() -> Self {
        Self::Transport(TransportError::ConnectionLost)
    }

    /// `true` once the connection is permanently gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Transport(TransportError::ConnectionClosed))
    }
}
