//! IPC error types

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during inter-process communication
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    #[error("No ack for {correlation_id} after {attempts} attempts")]
    AckTimeout { correlation_id: Uuid, attempts: u32 },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl IpcError {
    /// Whether another delivery attempt can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IpcError::IoError(_) | IpcError::AckTimeout { .. })
    }

    /// Whether the peer link is beyond recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::ConnectionClosed | IpcError::ProtocolVersionMismatch { .. }
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::DeserializationError(err.to_string())
    }
}
