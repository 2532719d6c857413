//! Integration test: rgfx server over TCP
//!
//! Starts an `RgfxServer` on an ephemeral port with the software device and
//! talks to it through a real multi-channel `Connection`: handshake,
//! DeviceInit, bake/submit/wait with a readback push, metrics, session
//! cleanup on disconnect, the session-wide idle timeout and graceful
//! shutdown.
//!
//! Run with: cargo test -p rgfx-server --test server_test

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use rgfx_core::config::RgfxConfig;
use rgfx_protocol::messages::{
    BatchCreated, BeginFrame, CmdBufBake, CmdBufBaked, CreateBatch, CreateBuffer, DefaultResponse,
    DevToHostCopy, DeviceInfo, DeviceInit, Hello, MetricsData, Ping, Pong, QueryMetrics,
    ResourceCreated, SubmitBatch, WaitBatch,
};
use rgfx_protocol::records::write_record;
use rgfx_protocol::types::{BufferDesc, BufferUsage};
use rgfx_protocol::wire::DEFAULT_MAX_PAYLOAD;
use rgfx_protocol::{Frame, Message, ProtocolError, QueueType, Record, CATALOG_VERSION};
use rgfx_server::{RgfxServer, ServerError};
use rgfx_transport::framing::{read_frame, write_frame};
use rgfx_transport::{Connection, ConnectionOptions, PushHandler, TransportError};

#[derive(Default)]
struct CollectingPush {
    frames: Mutex<Vec<Frame>>,
}

impl PushHandler for CollectingPush {
    fn on_push(&self, frame: Frame) {
        self.frames.lock().push(frame);
    }
}

struct Running {
    server: Arc<RgfxServer>,
    addr: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), ServerError>>,
}

async fn start(mut config: RgfxConfig) -> Running {
    config.server.metrics_interval_secs = 0;
    let server = Arc::new(RgfxServer::new(&config));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(server.clone().serve(listener, rx));
    Running { server, addr, shutdown, task }
}

fn options(channels: u32) -> ConnectionOptions {
    ConnectionOptions {
        client_name: "server-test".into(),
        channels,
        request_timeout: Duration::from_secs(5),
        max_payload: DEFAULT_MAX_PAYLOAD,
    }
}

async fn connect(addr: &str, channels: u32, push: Arc<CollectingPush>) -> Connection {
    Connection::connect(addr, options(channels), push).await.expect("connect")
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}

#[tokio::test]
async fn test_bake_round_trip_over_two_channels() {
    let running = start(RgfxConfig::default()).await;
    let push = Arc::new(CollectingPush::default());
    let conn = connect(&running.addr, 2, push.clone()).await;
    assert_eq!(conn.channel_count(), 2);

    let info: DeviceInfo = conn.call(DeviceInit::new("server-test")).await.expect("device init");
    assert_eq!(info.catalog_version, CATALOG_VERSION);

    conn.request(Frame::new(BeginFrame)).await.expect("begin frame");
    let buffer: ResourceCreated = conn
        .call(CreateBuffer {
            desc: BufferDesc::new(16, BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST),
            label: "rt".into(),
        })
        .await
        .expect("create buffer");
    let batch: BatchCreated = conn
        .call(CreateBatch { queue: QueueType::Graphics, label: "rt".into(), input_deps: vec![] })
        .await
        .expect("create batch");

    let records = [
        Record::BeginTransfer { label: "rt".into() },
        Record::FillBuffer { buffer: buffer.id, offset: 0, size: 16, data: 0x0102_0304 },
        Record::ReadbackBuffer { readback: 0, buffer: buffer.id, offset: 0 },
    ];
    let mut blob = Vec::new();
    for record in &records {
        write_record(&mut blob, record).expect("encode");
    }
    let bake = CmdBufBake {
        batch: batch.batch,
        exe_index: 0,
        catalog_version: CATALOG_VERSION,
        record_count: records.len() as u32,
        block_size: 4096,
        records_size: blob.len() as u64,
        host_to_dev: vec![],
        dev_to_host: vec![DevToHostCopy { token: 42, size: 16 }],
    };
    let baked: CmdBufBaked = conn.call_frame(Frame::with_blob(bake, blob)).await.expect("bake");
    assert!(baked.cmdbuf.is_valid());

    let submitted: DefaultResponse =
        conn.call(SubmitBatch { batch: batch.batch, immediately: true }).await.expect("submit");
    assert!(submitted.ok);
    let waited: DefaultResponse =
        conn.call(WaitBatch { batch: batch.batch, timeout_ms: 2000 }).await.expect("wait");
    assert!(waited.ok);

    let pushed = push.frames.lock().clone();
    let readback = pushed
        .iter()
        .find(|f| matches!(&f.message, Message::UploadDataAndCopy(p) if p.token == 42))
        .expect("readback pushed before the wait response");
    assert_eq!(readback.blob, 0x0102_0304u32.to_le_bytes().repeat(4));

    let metrics: MetricsData = conn.call(QueryMetrics).await.expect("metrics");
    assert_eq!(metrics.bakes_total, 1);
    assert_eq!(metrics.bakes_failed, 0);
    assert_eq!(metrics.connections_active, 2);

    let _ = running.shutdown.send(true);
}

#[tokio::test]
async fn test_device_requests_need_device_init() {
    let running = start(RgfxConfig::default()).await;
    let conn = connect(&running.addr, 1, Arc::default()).await;

    let _: Pong = conn.call(Ping).await.expect("ping");
    match conn.request(Frame::new(BeginFrame)).await {
        Err(TransportError::Remote(_)) => {}
        other => panic!("expected a remote error, got {:?}", other.map(|f| f.message)),
    }
    // The channel stays usable after a remote error.
    let _: Pong = conn.call(Ping).await.expect("ping after error");

    let _ = running.shutdown.send(true);
}

#[tokio::test]
async fn test_version_mismatch_is_rejected() {
    let running = start(RgfxConfig::default()).await;
    let mut stream = TcpStream::connect(&running.addr).await.expect("connect");
    let hello = Hello {
        protocol_version: 99,
        client_name: "old".into(),
        session_token: 0,
        channel: 0,
    };
    write_frame(&mut stream, &Frame::new(hello), DEFAULT_MAX_PAYLOAD).await.expect("write");
    let reply = read_frame(&mut stream, DEFAULT_MAX_PAYLOAD).await.expect("read");
    match reply.message {
        Message::ErrorResponse(e) => {
            assert!(matches!(e.error, ProtocolError::VersionMismatch { found: 99, .. }))
        }
        other => panic!("expected ErrorResponse, got {:?}", other),
    }
    assert_eq!(running.server.session_count(), 0);

    let _ = running.shutdown.send(true);
}

#[tokio::test]
async fn test_unknown_session_token_is_rejected() {
    let running = start(RgfxConfig::default()).await;
    let mut stream = TcpStream::connect(&running.addr).await.expect("connect");
    let hello = Hello {
        protocol_version: rgfx_protocol::PROTOCOL_VERSION,
        client_name: "joiner".into(),
        session_token: 12345,
        channel: 1,
    };
    write_frame(&mut stream, &Frame::new(hello), DEFAULT_MAX_PAYLOAD).await.expect("write");
    let reply = read_frame(&mut stream, DEFAULT_MAX_PAYLOAD).await.expect("read");
    assert!(matches!(
        reply.message,
        Message::ErrorResponse(e) if matches!(e.error, ProtocolError::HandshakeFailed(_))
    ));

    let _ = running.shutdown.send(true);
}

#[tokio::test]
async fn test_max_clients_limits_sessions() {
    let mut config = RgfxConfig::default();
    config.server.max_clients = 1;
    let running = start(config).await;

    let _first = connect(&running.addr, 1, Arc::default()).await;
    match Connection::connect(&running.addr, options(1), Arc::new(CollectingPush::default())).await {
        Err(TransportError::Handshake(_)) => {}
        Err(other) => panic!("expected a handshake error, got {}", other),
        Ok(_) => panic!("second session accepted past max_clients"),
    }

    let _ = running.shutdown.send(true);
}

#[tokio::test]
async fn test_disconnect_ends_session_and_releases_device() {
    let running = start(RgfxConfig::default()).await;
    let conn = connect(&running.addr, 2, Arc::default()).await;
    let _: DeviceInfo = conn.call(DeviceInit::new("leaky")).await.expect("device init");
    let created: ResourceCreated = conn
        .call(CreateBuffer {
            desc: BufferDesc::new(64, BufferUsage::TRANSFER_DST),
            label: "leaked".into(),
        })
        .await
        .expect("create buffer");
    assert!(created.id.is_valid());
    assert_eq!(running.server.session_count(), 1);

    drop(conn);
    let server = running.server.clone();
    assert!(wait_until(|| server.session_count() == 0).await, "session outlived its channels");

    let _ = running.shutdown.send(true);
}

#[tokio::test]
async fn test_side_channels_survive_sequential_traffic() {
    let mut config = RgfxConfig::default();
    config.server.idle_timeout_secs = 1;
    let running = start(config).await;
    let conn = connect(&running.addr, 2, Arc::default()).await;

    // Sequential requests only ever lease channel 0; channel 1 stays quiet
    // well past the idle timeout.
    for _ in 0..6 {
        let _: Pong = conn.call(Ping).await.expect("sequential ping");
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let (a, b) = tokio::join!(conn.call::<Pong>(Ping), conn.call::<Pong>(Ping));
    assert!(a.is_ok(), "first concurrent ping: {:?}", a.err());
    assert!(b.is_ok(), "second concurrent ping: {:?}", b.err());
    assert!(!conn.is_lost());
    assert_eq!(running.server.session_count(), 1);

    let _ = running.shutdown.send(true);
}

#[tokio::test]
async fn test_quiet_session_is_dropped_after_idle_timeout() {
    let mut config = RgfxConfig::default();
    config.server.idle_timeout_secs = 1;
    let running = start(config).await;
    let conn = connect(&running.addr, 2, Arc::default()).await;
    let _: DeviceInfo = conn.call(DeviceInit::new("quiet")).await.expect("device init");
    assert_eq!(running.server.session_count(), 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let server = running.server.clone();
    assert!(wait_until(|| server.session_count() == 0).await, "idle session kept open");

    match conn.request(Frame::new(Ping)).await {
        Err(TransportError::ConnectionLost) => {}
        other => panic!("expected ConnectionLost, got {:?}", other.map(|f| f.message)),
    }
    assert!(conn.is_lost());

    let _ = running.shutdown.send(true);
}

#[tokio::test]
async fn test_shutdown_stops_accepting_and_drains() {
    let running = start(RgfxConfig::default()).await;
    let conn = connect(&running.addr, 1, Arc::default()).await;
    let _: Pong = conn.call(Ping).await.expect("ping");

    running.shutdown.send(true).expect("signal shutdown");
    let result = tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .expect("server stopped in time")
        .expect("server task");
    assert!(result.is_ok());
    assert_eq!(running.server.session_count(), 0);

    assert!(conn.request(Frame::new(Ping)).await.is_err());
}
