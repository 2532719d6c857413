use std::borrow::Cow;

use crate::messages::{self, Message, MessageTypeId};

/// Wire protocol magic bytes: "RX"
pub const MAGIC: [u8; 2] = [0x52, 0x58];

/// Default bound on a frame payload (the per-channel framing buffer): 4 MB
pub const DEFAULT_MAX_PAYLOAD: u32 = 4 * 1024 * 1024;

/// Maximum trailing blob size: 256 MB
pub const MAX_BLOB_SIZE: u32 = 256 * 1024 * 1024;

/// Frame header size in bytes:
/// magic(2) + flags(1) + type_id(2) + payload_len(4) + blob_len(4) = 13
pub const HEADER_SIZE: usize = 13;

/// Minimum payload size to attempt LZ4 compression (bytes).
/// Payloads smaller than this are sent uncompressed to avoid overhead.
const COMPRESSION_THRESHOLD: usize = 512;

bitflags::bitflags! {
    /// Frame flags byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const COMPRESSED  = 0b0000_0001;
        const HAS_BLOB    = 0b0000_0010;
        const ERROR       = 0b0000_0100;
        const PUSH        = 0b0000_1000;
    }
}

/// Decoded frame header. All integers are little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub type_id: MessageTypeId,
    pub payload_len: u32,
    pub blob_len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&MAGIC);
        out[2] = self.flags.bits();
        out[3..5].copy_from_slice(&self.type_id.0.to_le_bytes());
        out[5..9].copy_from_slice(&self.payload_len.to_le_bytes());
        out[9..13].copy_from_slice(&self.blob_len.to_le_bytes());
        out
    }

    /// Decode and bound-check a header. A bad magic means the stream is out of
    /// sync; there is no resynchronization.
    pub fn decode(header: &[u8; HEADER_SIZE], max_payload: u32) -> Result<Self, WireError> {
        if header[0] != MAGIC[0] || header[1] != MAGIC[1] {
            return Err(WireError::InvalidMagic);
        }

        let flags = FrameFlags::from_bits_truncate(header[2]);
        let type_id = MessageTypeId(u16::from_le_bytes([header[3], header[4]]));
        let payload_len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
        let blob_len = u32::from_le_bytes([header[9], header[10], header[11], header[12]]);

        if payload_len > max_payload {
            return Err(WireError::FrameTooLarge(payload_len));
        }
        if blob_len > MAX_BLOB_SIZE {
            return Err(WireError::FrameTooLarge(blob_len));
        }
        if flags.contains(FrameFlags::HAS_BLOB) != (blob_len > 0) {
            return Err(WireError::Malformed("blob flag does not match blob length".into()));
        }

        Ok(Self { flags, type_id, payload_len, blob_len })
    }
}

/// A decoded message with its optional trailing blob.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message: Message,
    pub blob: Vec<u8>,
}

impl Frame {
    pub fn new(message: impl Into<Message>) -> Self {
        Self { message: message.into(), blob: Vec::new() }
    }

    pub fn with_blob(message: impl Into<Message>, blob: Vec<u8>) -> Self {
        Self { message: message.into(), blob }
    }
}

/// Encode header + payload for `msg`. The blob (if any) is written by the
/// caller right after, `blob_len` bytes long.
pub fn encode_message(msg: &Message, blob_len: usize, max_payload: u32) -> Result<Vec<u8>, WireError> {
    let payload = msg.encode_payload()?;

    // Attempt LZ4 compression for payloads above threshold
    let (final_payload, compression_flag) = if payload.len() > COMPRESSION_THRESHOLD {
        let compressed = lz4_flex::compress_prepend_size(&payload);
        if compressed.len() < payload.len() {
            (Cow::Owned(compressed), FrameFlags::COMPRESSED)
        } else {
            (Cow::Borrowed(payload.as_slice()), FrameFlags::empty())
        }
    } else {
        (Cow::Borrowed(payload.as_slice()), FrameFlags::empty())
    };

    let payload_len = u32::try_from(final_payload.len())
        .ok()
        .filter(|len| *len <= max_payload)
        .ok_or(WireError::FrameTooLarge(final_payload.len().min(u32::MAX as usize) as u32))?;
    let blob_len = u32::try_from(blob_len)
        .ok()
        .filter(|len| *len <= MAX_BLOB_SIZE)
        .ok_or(WireError::FrameTooLarge(blob_len.min(u32::MAX as usize) as u32))?;

    let mut flags = compression_flag;
    if blob_len > 0 {
        flags |= FrameFlags::HAS_BLOB;
    }
    match msg {
        Message::ErrorResponse(_) => flags |= FrameFlags::ERROR,
        m if m.is_push() => flags |= FrameFlags::PUSH,
        _ => {}
    }

    let header = FrameHeader { flags, type_id: msg.type_id(), payload_len, blob_len };

    let mut frame = Vec::with_capacity(HEADER_SIZE + final_payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&final_payload);
    Ok(frame)
}

/// Encode a complete frame, blob included. Convenient for tests and small
/// in-memory transports.
pub fn encode_frame(frame: &Frame, max_payload: u32) -> Result<Vec<u8>, WireError> {
    let mut bytes = encode_message(&frame.message, frame.blob.len(), max_payload)?;
    bytes.extend_from_slice(&frame.blob);
    Ok(bytes)
}

/// Decode a message payload, decompressing if the COMPRESSED flag is set.
pub fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<Message, WireError> {
    let data: Cow<'_, [u8]> = if header.flags.contains(FrameFlags::COMPRESSED) {
        Cow::Owned(
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| WireError::DecompressionError(e.to_string()))?,
        )
    } else {
        Cow::Borrowed(payload)
    };
    messages::decode_typed(header.type_id, &data)
}

/// Decode a complete in-memory frame produced by [`encode_frame`].
pub fn decode_frame(bytes: &[u8], max_payload: u32) -> Result<Frame, WireError> {
    let header_bytes: &[u8; HEADER_SIZE] = bytes
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or(WireError::Truncated)?;
    let header = FrameHeader::decode(header_bytes, max_payload)?;

    let payload_end = HEADER_SIZE + header.payload_len as usize;
    let blob_end = payload_end + header.blob_len as usize;
    if bytes.len() < blob_end {
        return Err(WireError::Truncated);
    }

    let message = decode_payload(&header, &bytes[HEADER_SIZE..payload_end])?;
    Ok(Frame { message, blob: bytes[payload_end..blob_end].to_vec() })
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),
    #[error("truncated frame")]
    Truncated,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message type 0x{0:04x}")]
    UnknownType(u16),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("decompression error: {0}")]
    DecompressionError(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Errors after which the byte stream can no longer be trusted.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            WireError::InvalidMagic
                | WireError::FrameTooLarge(_)
                | WireError::Truncated
                | WireError::Malformed(_)
                | WireError::Io(_)
        )
    }
}
