use serde::{Deserialize, Serialize};

/// Failure reported across the process boundary inside an `ErrorResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ProtocolError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("protocol version mismatch: expected {expected}, got {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unsupported message type 0x{0:04x}")]
    UnsupportedMessage(u16),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("timeout")]
    Timeout,

    #[error("server disconnected")]
    Disconnected,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),
}
