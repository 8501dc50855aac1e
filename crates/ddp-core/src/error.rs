//! Error types for the DDP client engine.
//!
//! Transport errors are transient and drive reconnection. Version errors are
//! permanent. Server errors belong to the single caller that triggered them.
//! The remaining variants report broken internal invariants or misuse.

use crate::protocol::ServerError;
use thiserror::Error;

/// Main error type for the DDP client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DdpError {
    // Connection errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Protocol version {offered} rejected by server (server suggested {suggested})")]
    ProtocolVersion { offered: String, suggested: String },

    // Application errors
    #[error("Server error: {0}")]
    Server(ServerError),

    #[error("Invalid login result: {message}")]
    InvalidLogin { message: String },

    #[error("Subscription {id} stopped before it became ready")]
    SubscriptionStopped { id: String },

    // Invariant violations
    #[error("Duplicate correlation id: {id}")]
    DuplicateCorrelation { id: String },

    #[error("Completion callback for {id} invoked more than once")]
    CallbackContract { id: String },

    // Encoding errors
    #[error("Codec error: {message}")]
    Codec { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Client event loop is no longer running")]
    ClientClosed,
}

/// Result type alias for DDP client operations.
pub type Result<T> = std::result::Result<T, DdpError>;

impl From<serde_json::Error> for DdpError {
    fn from(err: serde_json::Error) -> Self {
        DdpError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<ServerError> for DdpError {
    fn from(err: ServerError) -> Self {
        DdpError::Server(err)
    }
}

impl DdpError {
    /// Create a transport error from any displayable cause.
    pub fn transport(message: impl Into<String>) -> Self {
        DdpError::Transport {
            message: message.into(),
        }
    }

    /// Whether the error is expected to clear up on its own (by reconnecting).
    pub fn is_transient(&self) -> bool {
        matches!(self, DdpError::Transport { .. })
    }

    /// Whether the error reflects a bug in the client rather than the network or server.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            DdpError::DuplicateCorrelation { .. } | DdpError::CallbackContract { .. }
        )
    }

    /// The server error payload, if this error came from the server.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            DdpError::Server(err) => Some(err),
            _ => None,
        }
    }
}
