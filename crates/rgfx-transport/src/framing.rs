//! Async frame I/O over any byte stream.
//!
//! One frame is `header | payload | blob`. A frame whose type id is not in
//! this build's catalog is consumed in full and skipped, so the stream stays
//! in sync across catalog additions.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use rgfx_protocol::wire::{self, FrameHeader, HEADER_SIZE};
use rgfx_protocol::{Frame, WireError};

use crate::error::TransportError;

/// Read the next frame the catalog knows how to decode.
pub async fn read_frame<R>(reader: &mut R, max_payload: u32) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        let mut header_buf = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        }
        let header = FrameHeader::decode(&header_buf, max_payload)?;

        let mut payload = vec![0u8; header.payload_len as usize];
        reader.read_exact(&mut payload).await?;
        let mut blob = vec![0u8; header.blob_len as usize];
        reader.read_exact(&mut blob).await?;

        match wire::decode_payload(&header, &payload) {
            Ok(message) => {
                trace!(message = message.name(), payload = payload.len(), blob = blob.len(), "frame in");
                return Ok(Frame { message, blob });
            }
            Err(WireError::UnknownType(type_id)) => {
                warn!(
                    type_id = format_args!("0x{:04x}", type_id),
                    payload = header.payload_len,
                    blob = header.blob_len,
                    "skipping frame with unknown message type"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write one frame and flush.
pub async fn write_frame<W>(
    writer: &mut W,
    frame: &Frame,
    max_payload: u32,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let head = wire::encode_message(&frame.message, frame.blob.len(), max_payload)?;
    writer.write_all(&head).await?;
    if !frame.blob.is_empty() {
        writer.write_all(&frame.blob).await?;
    }
    writer.flush().await?;
    trace!(message = frame.message.name(), blob = frame.blob.len(), "frame out");
    Ok(())
}
