//! Integration test: wire framing and the record stream
//!
//! Frames go through `encode_frame` / `decode_frame` as they would on a
//! channel; records through `write_record` / `RecordStream`. Covers header
//! flags, compression, bounds and the desync classification.
//!
//! Run with: cargo test -p rgfx-protocol --test wire_test

use rkyv::util::AlignedVec;

use rgfx_protocol::messages::{Hello, Log, UploadDataAndCopy};
use rgfx_protocol::records::{write_record, RECORD_PREFIX};
use rgfx_protocol::wire::{
    decode_frame, encode_frame, FrameFlags, FrameHeader, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC,
};
use rgfx_protocol::{
    Frame, FrameId, Message, ProtocolError, Record, RecordStream, RemoteId, ResourceType,
    WireError, PROTOCOL_VERSION,
};

fn header_of(bytes: &[u8]) -> FrameHeader {
    let header: &[u8; HEADER_SIZE] = bytes[..HEADER_SIZE].try_into().expect("header");
    FrameHeader::decode(header, DEFAULT_MAX_PAYLOAD).expect("decode header")
}

fn small_log() -> Log {
    Log { level: 1, target: "test".into(), message: "hi".into() }
}

// ── Frames ──────────────────────────────────────────────────────────────

#[test]
fn test_request_frame_survives_the_wire() {
    let hello = Hello {
        protocol_version: PROTOCOL_VERSION,
        client_name: "wire-test".into(),
        session_token: 0,
        channel: 0,
    };
    let bytes = encode_frame(&Frame::new(hello.clone()), DEFAULT_MAX_PAYLOAD).expect("encode");
    assert_eq!(&bytes[..2], &MAGIC);

    let header = header_of(&bytes);
    assert!(header.flags.is_empty());
    assert_eq!(header.blob_len, 0);
    assert_eq!(bytes.len(), HEADER_SIZE + header.payload_len as usize);

    let frame = decode_frame(&bytes, DEFAULT_MAX_PAYLOAD).expect("decode");
    assert_eq!(frame.message, Message::Hello(hello));
    assert!(frame.blob.is_empty());
}

#[test]
fn test_pushes_errors_and_blobs_are_flagged() {
    let push = Frame::with_blob(UploadDataAndCopy { token: 9, offset: 0 }, vec![7; 32]);
    let bytes = encode_frame(&push, DEFAULT_MAX_PAYLOAD).expect("encode");
    let header = header_of(&bytes);
    assert!(header.flags.contains(FrameFlags::PUSH | FrameFlags::HAS_BLOB));
    assert_eq!(header.blob_len, 32);
    assert_eq!(decode_frame(&bytes, DEFAULT_MAX_PAYLOAD).expect("decode"), push);

    let error = Frame::new(Message::error(ProtocolError::Validation("bad".into())));
    let bytes = encode_frame(&error, DEFAULT_MAX_PAYLOAD).expect("encode");
    assert!(header_of(&bytes).flags.contains(FrameFlags::ERROR));
    assert!(!header_of(&bytes).flags.contains(FrameFlags::PUSH));
}

#[test]
fn test_large_payloads_are_compressed() {
    let log = Log { level: 2, target: "wire".into(), message: "x".repeat(8 * 1024) };
    let bytes = encode_frame(&Frame::new(log.clone()), DEFAULT_MAX_PAYLOAD).expect("encode");
    let header = header_of(&bytes);
    assert!(header.flags.contains(FrameFlags::COMPRESSED));
    assert!((header.payload_len as usize) < log.message.len());
    assert_eq!(decode_frame(&bytes, DEFAULT_MAX_PAYLOAD).expect("decode").message, Message::Log(log));
}

#[test]
fn test_bad_headers_desync_the_stream() {
    let bytes = encode_frame(&Frame::new(small_log()), DEFAULT_MAX_PAYLOAD).expect("encode");

    let mut garbled = bytes.clone();
    garbled[0] = b'Z';
    let err = decode_frame(&garbled, DEFAULT_MAX_PAYLOAD).expect_err("bad magic");
    assert!(matches!(err, WireError::InvalidMagic));
    assert!(err.is_desync());

    let err = decode_frame(&bytes[..bytes.len() - 1], DEFAULT_MAX_PAYLOAD).expect_err("short");
    assert!(matches!(err, WireError::Truncated));

    let err = decode_frame(&bytes, 1).expect_err("bound");
    assert!(matches!(err, WireError::FrameTooLarge(_)));

    let mut unknown = bytes.clone();
    unknown[3..5].copy_from_slice(&0xFFFFu16.to_le_bytes());
    let err = decode_frame(&unknown, DEFAULT_MAX_PAYLOAD).expect_err("unknown type");
    assert!(matches!(err, WireError::UnknownType(0xFFFF)));
    assert!(!err.is_desync());
}

// ── Records ─────────────────────────────────────────────────────────────

#[test]
fn test_record_stream_walks_prefixed_records() {
    let buffer = RemoteId::new(3, 1, ResourceType::Buffer);
    let records = vec![
        Record::BeginTransfer { label: "t".into() },
        Record::FillBuffer { buffer, offset: 0, size: 64, data: 1 },
        Record::CommitBarriers,
    ];
    let mut bytes = Vec::new();
    let mut written = 0;
    for record in &records {
        written += write_record(&mut bytes, record).expect("write");
    }
    assert_eq!(written, bytes.len());

    let mut scratch = AlignedVec::<16>::new();
    let mut stream = RecordStream::new(&bytes);
    let mut decoded = Vec::new();
    for item in stream.by_ref() {
        decoded.push(Record::decode(item.expect("framed"), &mut scratch).expect("decode"));
    }
    assert_eq!(decoded, records);
    assert_eq!(stream.position(), bytes.len());

    // A cut inside the last record surfaces once, then the stream ends.
    let cut = &bytes[..bytes.len() - 1];
    let results: Vec<_> = RecordStream::new(cut).collect();
    assert_eq!(results.len(), 3);
    assert!(matches!(results[2], Err(WireError::Truncated)));

    let results: Vec<_> = RecordStream::new(&bytes[..RECORD_PREFIX - 1]).collect();
    assert!(matches!(results.as_slice(), [Err(WireError::Truncated)]));
}

#[test]
fn test_remote_ids_and_frame_ids() {
    let id = RemoteId::new(5, 2, ResourceType::Image);
    assert!(id.is_valid());
    assert_eq!(id.to_string(), "Image#5v2");
    assert!(!RemoteId::invalid().is_valid());
    assert!(!RemoteId::new(5, 2, ResourceType::None).is_valid());
    assert_eq!(RemoteId::invalid().to_string(), "<invalid>");

    let frame = FrameId::new(5, 3);
    assert_eq!(frame.index(), 2);
    assert_eq!(frame.next().unique(), 6);
    assert_eq!(frame.next().index(), 0);
}
