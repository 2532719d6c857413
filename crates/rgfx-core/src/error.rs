use std::time::Duration;

use rgfx_protocol::{ContextKind, ProtocolError};

use crate::handle::Handle;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GfxError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("stale or invalid handle: {0}")]
    StaleHandle(Handle),

    #[error("context kind mismatch: {record} is not allowed in {active:?}")]
    KindMismatch { record: &'static str, active: ContextKind },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl GfxError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GfxError::Validation(msg.into())
    }

    /// Rejected input, no side effects.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GfxError::Validation(_) | GfxError::StaleHandle(_) | GfxError::KindMismatch { .. }
        )
    }

    /// Waiting again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GfxError::Timeout(_))
    }
}

impl From<GfxError> for ProtocolError {
    fn from(err: GfxError) -> Self {
        match err {
            GfxError::StaleHandle(h) => ProtocolError::InvalidHandle(h.to_string()),
            GfxError::Validation(_) | GfxError::KindMismatch { .. } => {
                ProtocolError::Validation(err.to_string())
            }
            GfxError::Timeout(_) => ProtocolError::Timeout,
            GfxError::ConnectionLost => ProtocolError::Disconnected,
            GfxError::ResourceExhausted(msg) => ProtocolError::ResourceExhausted(msg),
            GfxError::Backend(msg) => ProtocolError::Backend(msg),
            GfxError::Transport(msg)
            | GfxError::Protocol(msg)
            | GfxError::Config(msg)
            | GfxError::Io(msg) => ProtocolError::Backend(msg),
        }
    }
}

impl From<std::io::Error> for GfxError {
    fn from(err: std::io::Error) -> Self {
        GfxError::Io(err.to_string())
    }
}

impl From<ProtocolError> for GfxError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Validation(msg) | ProtocolError::InvalidHandle(msg) => {
                GfxError::Validation(msg)
            }
            ProtocolError::Timeout => GfxError::Timeout(Duration::ZERO),
            ProtocolError::Disconnected => GfxError::ConnectionLost,
            ProtocolError::ResourceExhausted(msg) => GfxError::ResourceExhausted(msg),
            ProtocolError::Backend(msg) => GfxError::Backend(msg),
            other => GfxError::Protocol(other.to_string()),
        }
    }
}
