use std::time::Duration;

use rgfx_core::GfxError;
use rgfx_protocol::{ProtocolError, WireError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connection lost")]
    ConnectionLost,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("remote error: {0}")]
    Remote(ProtocolError),

    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse { expected: &'static str, got: &'static str },

    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl TransportError {
    /// Errors after which the channel that produced them is unusable.
    pub fn breaks_channel(&self) -> bool {
        match self {
            TransportError::Io(_)
            | TransportError::ConnectionClosed
            | TransportError::ConnectionLost
            | TransportError::Timeout(_) => true,
            TransportError::Wire(e) => e.is_desync(),
            _ => false,
        }
    }
}

impl From<TransportError> for GfxError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Remote(e) => e.into(),
            TransportError::Timeout(d) => GfxError::Timeout(d),
            TransportError::ConnectionLost | TransportError::ConnectionClosed => {
                GfxError::ConnectionLost
            }
            TransportError::Io(e) => GfxError::Io(e.to_string()),
            other => GfxError::Transport(other.to_string()),
        }
    }
}
