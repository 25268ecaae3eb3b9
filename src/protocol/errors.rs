//! Capability protocol error types.

use thiserror::Error;

/// Errors raised by a capability protocol client.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The provider process could not be spawned.
    #[error("failed to spawn provider '{provider}': {reason}")]
    SpawnFailed {
        provider: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("provider '{provider}' initialization failed: {reason}")]
    InitFailed {
        provider: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error, closed pipe).
    #[error("transport error for provider '{provider}': {reason}")]
    TransportError {
        provider: String,
        reason: String,
    },

    /// Provider returned a JSON-RPC error response.
    #[error("provider error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request did not complete in time.
    #[error("request '{method}' to provider '{provider}' timed out after {timeout_ms}ms")]
    Timeout {
        provider: String,
        method: String,
        timeout_ms: u64,
    },

    /// A call was made without an open channel.
    #[error("provider '{provider}' is not connected")]
    NotConnected {
        provider: String,
    },

    /// A response arrived but its payload did not have the expected shape.
    #[error("invalid '{method}' response from provider '{provider}': {reason}")]
    InvalidResponse {
        provider: String,
        method: String,
        reason: String,
    },
}

impl ProtocolError {
    /// Whether the failure happened below the protocol (process or pipe level).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::SpawnFailed { .. }
                | ProtocolError::InitFailed { .. }
                | ProtocolError::TransportError { .. }
                | ProtocolError::Timeout { .. }
        )
    }
}
