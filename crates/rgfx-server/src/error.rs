use rgfx_core::GfxError;
use rgfx_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("device not initialized")]
    NoDevice,

    #[error(transparent)]
    Gfx(#[from] GfxError),
}

impl From<ServerError> for ProtocolError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::NoDevice => {
                ProtocolError::Validation("DeviceInit must precede device requests".into())
            }
            ServerError::Gfx(e) => e.into(),
            other => ProtocolError::Backend(other.to_string()),
        }
    }
}
