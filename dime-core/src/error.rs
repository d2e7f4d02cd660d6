/// DiME Error Types
///
/// Error handling for broker operations.
use std::io;
use thiserror::Error;

/// Main error type for broker operations
#[derive(Error, Debug)]
pub enum DimeError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Unrecoverable framing error (bad magic, oversized frame, bad JSON)
    #[error("Framing error: {0}")]
    Framing(String),

    /// Protocol error (bad command, missing field); recoverable per session
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid listener endpoint
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] crate::endpoint::EndpointError),

    /// Metadata could not be serialized
    #[error("Metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Registry channel send failed (broker shutting down)
    #[error("Registry unavailable")]
    RegistrySend,

    /// Registry reply channel closed before answering
    #[error("Registry dropped the request")]
    RegistryRecv,

    /// Socket closed
    #[error("Socket closed")]
    SocketClosed,
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, DimeError>;

impl DimeError {
    /// Create a framing error with a message
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True when the session should be torn down rather than answered
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Framing(_)
                | Self::SocketClosed
                | Self::RegistrySend
                | Self::RegistryRecv
        )
    }
}
