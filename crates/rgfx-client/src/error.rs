use rgfx_core::{GfxError, Handle};
use rgfx_protocol::RemoteId;
use rgfx_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(TransportError),

    #[error(transparent)]
    Gfx(#[from] GfxError),

    #[error("host speaks record catalog v{host}, client records v{client}")]
    CatalogMismatch { host: u16, client: u16 },

    #[error("host rejected stream {exe_index} of batch {batch}")]
    BakeRejected { batch: RemoteId, exe_index: u32 },

    #[error("handle {0} is not mapped to a host resource")]
    UnknownHandle(Handle),

    #[error("connection lost")]
    ConnectionLost,
}

impl ClientError {
    /// The frame loop must stop; every later request fails the same way.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ClientError::ConnectionLost | ClientError::Gfx(GfxError::ConnectionLost))
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionLost | TransportError::ConnectionClosed => {
                ClientError::ConnectionLost
            }
            other => ClientError::Transport(other),
        }
    }
}

impl From<ClientError> for GfxError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Transport(e) => e.into(),
            ClientError::Gfx(e) => e,
            ClientError::ConnectionLost => GfxError::ConnectionLost,
            ClientError::UnknownHandle(h) => GfxError::StaleHandle(h),
            other => GfxError::Protocol(other.to_string()),
        }
    }
}
