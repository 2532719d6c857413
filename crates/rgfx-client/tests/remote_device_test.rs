//! Integration test: remote device
//!
//! Drives `RemoteDevice` end to end against an in-process `RgfxServer` with
//! the software backend, and against a scripted host on an in-memory duplex
//! for failure cases: connection lost mid-bake and a catalog mismatch. The
//! readback registry is exercised directly at the end.
//!
//! Run with: cargo test -p rgfx-client --test remote_device_test

use std::sync::Arc;
use std::time::Duration;

use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio::sync::watch;

use rgfx_client::{ClientError, DescriptorUpdate, ReadbackRegistry, RemoteDevice};
use rgfx_core::config::RgfxConfig;
use rgfx_core::context::TransferContext;
use rgfx_core::{GfxError, Handle};
use rgfx_protocol::messages::{
    BatchCreated, DeviceInfo, HelloAck, Log, ResourceCreated, UploadDataAndCopy,
};
use rgfx_protocol::types::{BufferDesc, BufferUsage, PixelFormat};
use rgfx_protocol::wire::DEFAULT_MAX_PAYLOAD;
use rgfx_protocol::{
    Frame, Message, QueueType, RemoteId, ResourceType, SemaphoreValue, CATALOG_VERSION,
};
use rgfx_server::RgfxServer;
use rgfx_transport::connection::ByteStream;
use rgfx_transport::framing::{read_frame, write_frame};
use rgfx_transport::{Connection, ConnectionOptions, PushHandler};

const TIMEOUT: Duration = Duration::from_secs(2);

struct Host {
    config: RgfxConfig,
    shutdown: watch::Sender<bool>,
}

async fn start_host() -> Host {
    start_host_with(RgfxConfig::default()).await
}

async fn start_host_with(mut config: RgfxConfig) -> Host {
    config.server.metrics_interval_secs = 0;
    let server = Arc::new(RgfxServer::new(&config));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    config.client.address = listener.local_addr().expect("local addr").to_string();
    config.client.channels = 2;
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(server.serve(listener, rx));
    Host { config, shutdown }
}

fn usage() -> BufferUsage {
    BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST
}

#[tokio::test]
async fn test_capture_bake_and_read_back() {
    let host = start_host().await;
    let device = RemoteDevice::connect(&host.config, "client-test").await.expect("connect");
    assert_eq!(device.info().catalog_version, CATALOG_VERSION);

    device.begin_frame().await.expect("begin frame");
    let buffer = device.create_buffer(BufferDesc::new(64, usage()), "rt").await.expect("create");
    assert!(buffer.is_valid());
    let mut batch = device.create_batch(QueueType::Graphics, "rt", vec![]).await.expect("batch");

    let mut rec = device.recorder();
    rec.transfer("rt").fill_buffer(buffer, 0, 64, 0x1111_1111);
    rec.upload_buffer(buffer, 8, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let token = rec.readback_buffer(buffer, 0, 16);

    let cmdbuf = device.bake(&mut batch, rec).await.expect("bake");
    assert!(cmdbuf.is_valid());
    assert_eq!(batch.next_exe_index(), 1);

    device.submit_batch(&batch, true).await.expect("submit");
    assert!(device.wait_batch(&batch, TIMEOUT).await.expect("wait"));

    let data = device.readback(token, TIMEOUT).await.expect("readback");
    let mut expected = vec![0x11u8; 8];
    expected.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(data, expected);

    device.end_frame().await.expect("end frame");
    device.wait_all(TIMEOUT).await.expect("wait all");
    let _ = host.shutdown.send(true);
}

#[tokio::test]
async fn test_unbounded_timeouts_saturate() {
    let host = start_host().await;
    let device = RemoteDevice::connect(&host.config, "client-test").await.expect("connect");
    device.begin_frame().await.expect("begin frame");
    let buffer = device.create_buffer(BufferDesc::new(16, usage()), "long").await.expect("create");
    let mut batch = device.create_batch(QueueType::Graphics, "long", vec![]).await.expect("batch");
    let mut rec = device.recorder();
    rec.transfer("long").fill_buffer(buffer, 0, 16, 7);
    device.bake(&mut batch, rec).await.expect("bake");
    device.submit_batch(&batch, true).await.expect("submit");

    // Far past u64::MAX milliseconds; must not wrap into a short wait.
    assert!(device.wait_batch(&batch, Duration::MAX).await.expect("wait"));
    device.end_frame().await.expect("end frame");
    device.wait_all(Duration::MAX).await.expect("wait all");
    let _ = host.shutdown.send(true);
}

#[tokio::test]
async fn test_rejected_stream_leaves_the_batch_usable() {
    let host = start_host().await;
    let device = RemoteDevice::connect(&host.config, "client-test").await.expect("connect");
    device.begin_frame().await.expect("begin frame");
    let buffer = device.create_buffer(BufferDesc::new(16, usage()), "b").await.expect("create");
    let mut batch = device.create_batch(QueueType::Graphics, "b", vec![]).await.expect("batch");

    // Host-side failure: the buffer is too small for the fill.
    let mut bad = device.recorder();
    bad.transfer("bad").fill_buffer(buffer, 0, 4096, 0);
    match device.bake(&mut batch, bad).await {
        Err(ClientError::BakeRejected { exe_index: 0, .. }) => {}
        other => panic!("expected BakeRejected, got {:?}", other),
    }
    assert_eq!(batch.next_exe_index(), 0);

    let mut good = device.recorder();
    good.transfer("good").fill_buffer(buffer, 0, 16, 0);
    device.bake(&mut batch, good).await.expect("bake after rejection");
    device.skip_batch(batch).await.expect("skip");
    let _ = host.shutdown.send(true);
}

#[tokio::test]
async fn test_resources_release_describe_and_fail_cleanly() {
    let host = start_host().await;
    let device = RemoteDevice::connect(&host.config, "client-test").await.expect("connect");

    let empty = device.create_buffer(BufferDesc::new(0, usage()), "empty").await.expect("create");
    assert_eq!(empty, Handle::invalid());
    assert_eq!(device.live_handles(), 0);

    let buffer = device.create_buffer(BufferDesc::new(32, usage()), "described").await.expect("create");
    let description = device.describe(buffer).await.expect("describe");
    assert!(description.alive);
    assert_eq!(description.buffer.map(|b| b.size), Some(32));

    device.write_buffer(buffer, 0, vec![9; 32]).await.expect("write");

    let pipeline = device.load_pipeline("blit").await.expect("pipeline");
    let set = device.create_descriptor_set(pipeline, 0).await.expect("set");
    let update = DescriptorUpdate { binding: 0, element: 0, resource: buffer, offset: 0, size: 32 };
    device.update_descriptors(set, &[update]).await.expect("descriptor flush");

    assert!(device.release(buffer).await.expect("release"));
    assert!(matches!(device.describe(buffer).await, Err(ClientError::UnknownHandle(h)) if h == buffer));
    assert!(matches!(device.release(buffer).await, Err(ClientError::UnknownHandle(_))));

    // A recorder still naming the released buffer latches the stale handle.
    let mut rec = device.recorder();
    rec.transfer("stale").fill_buffer(buffer, 0, 4, 0);
    let mut batch = device.create_batch(QueueType::AsyncTransfer, "stale", vec![]).await;
    assert!(batch.is_err(), "no frame is recording yet");
    device.begin_frame().await.expect("begin frame");
    batch = device.create_batch(QueueType::AsyncTransfer, "stale", vec![]).await;
    let mut batch = batch.expect("batch");
    assert!(matches!(
        device.bake(&mut batch, rec).await,
        Err(ClientError::Gfx(GfxError::StaleHandle(h))) if h == buffer
    ));

    device.shutdown().await.expect("shutdown");
    let _ = host.shutdown.send(true);
}

#[tokio::test]
async fn test_swapchain_images_map_to_local_handles() {
    let host = start_host().await;
    let device = RemoteDevice::connect(&host.config, "client-test").await.expect("connect");

    let swapchain =
        device.create_swapchain(32, 32, PixelFormat::BGRA8Unorm, 2).await.expect("swapchain");
    assert_eq!(swapchain.images.len(), 2);
    assert!(swapchain.images.iter().all(|image| image.is_valid()));

    let (index, image) = device.acquire_image(&swapchain).await.expect("acquire");
    assert_eq!(image, swapchain.images[index as usize]);
    device.present(&swapchain, index, None).await.expect("present");

    let metrics = device.metrics().await.expect("metrics");
    assert_eq!(metrics.connections_active, 2);
    let _ = host.shutdown.send(true);
}

// ── Scripted host ───────────────────────────────────────────────────────

/// Answer each request with `reply`; `None` drops the connection.
fn scripted_host<F>(mut stream: DuplexStream, mut reply: F)
where
    F: FnMut(Message) -> Option<Frame> + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(frame) = read_frame(&mut stream, DEFAULT_MAX_PAYLOAD).await {
            match reply(frame.message) {
                Some(response) => {
                    if write_frame(&mut stream, &response, DEFAULT_MAX_PAYLOAD).await.is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    });
}

fn device_info(catalog_version: u16) -> DeviceInfo {
    DeviceInfo {
        device_name: "scripted".into(),
        host_name: "script".into(),
        platform: "test".into(),
        max_frames: 2,
        max_pending_batches: 8,
        supports_timeline: true,
        upload_block_size: 4096,
        catalog_version,
    }
}

fn handshake_reply(message: &Message) -> Option<Frame> {
    match message {
        Message::Hello(_) => Some(Frame::new(HelloAck {
            session_token: 1,
            session_id: 7,
            server_name: "script".into(),
        })),
        _ => None,
    }
}

async fn scripted_device(
    reply: impl FnMut(Message) -> Option<Frame> + Send + 'static,
) -> Result<RemoteDevice, ClientError> {
    let (client, server) = tokio::io::duplex(64 * 1024);
    scripted_host(server, reply);
    let readbacks = Arc::new(ReadbackRegistry::new());
    let options = ConnectionOptions { request_timeout: TIMEOUT, ..ConnectionOptions::default() };
    let streams: Vec<Box<dyn ByteStream>> = vec![Box::new(client)];
    let conn = Connection::handshake(streams, options, readbacks.clone()).await?;
    RemoteDevice::with_connection(conn, readbacks, &RgfxConfig::default().graphics, "scripted").await
}

#[tokio::test]
async fn test_connection_lost_during_bake() {
    let buffer = RemoteId::new(0, 1, ResourceType::Buffer);
    let batch = RemoteId::new(0, 0, ResourceType::None);
    let device = scripted_device(move |message| match message {
        Message::DeviceInit(_) => Some(Frame::new(device_info(CATALOG_VERSION))),
        Message::CreateBuffer(_) => Some(Frame::new(ResourceCreated { id: buffer })),
        Message::CreateBatch(_) => Some(Frame::new(BatchCreated {
            batch,
            completion: SemaphoreValue { semaphore: RemoteId::invalid(), value: 1 },
        })),
        // The host vanishes as soon as the stream arrives.
        Message::CmdBufBake(_) => None,
        other => handshake_reply(&other),
    })
    .await
    .expect("scripted device");

    let local = device.create_buffer(BufferDesc::new(64, usage()), "doomed").await.expect("create");
    let mut batch = device.create_batch(QueueType::Graphics, "doomed", vec![]).await.expect("batch");
    let mut rec = device.recorder();
    rec.transfer("doomed").fill_buffer(local, 0, 64, 0);
    let token = rec.readback_buffer(local, 0, 64);

    let lost = device.lost_signal();
    let err = device.bake(&mut batch, rec).await.expect_err("bake must fail");
    assert!(err.is_connection_lost(), "got {:?}", err);
    assert!(device.is_lost());
    assert!(*lost.borrow());
    assert_eq!(batch.next_exe_index(), 0);

    // Everything after the loss fails fast with the same error.
    assert!(matches!(device.readback(token, TIMEOUT).await, Err(ClientError::ConnectionLost)));
    assert!(matches!(device.ping().await, Err(ClientError::ConnectionLost)));

    // The host destroyed the buffer with the session; the local handle no
    // longer resolves to its old id.
    assert_eq!(device.remote_id(local), None);
    assert_eq!(device.live_handles(), 0);
    match device.release(local).await {
        Err(ClientError::UnknownHandle(h)) => assert_eq!(h, local),
        other => panic!("expected UnknownHandle, got {:?}", other),
    }
    let mut rec = device.recorder();
    rec.transfer("late").fill_buffer(local, 0, 64, 0);
    assert!(rec.into_stream().is_err());
}

#[tokio::test]
async fn test_quiet_side_channel_still_serves_after_sequential_use() {
    let mut config = RgfxConfig::default();
    config.server.idle_timeout_secs = 1;
    let host = start_host_with(config).await;
    let device = RemoteDevice::connect(&host.config, "client-test").await.expect("connect");
    let buffer = device.create_buffer(BufferDesc::new(16, usage()), "kept").await.expect("create");

    for _ in 0..6 {
        device.ping().await.expect("sequential ping");
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let (a, b) = tokio::join!(device.ping(), device.ping());
    assert!(a.is_ok() && b.is_ok(), "concurrent pings: {:?} / {:?}", a.err(), b.err());
    assert!(!device.is_lost());
    assert!(device.remote_id(buffer).is_some());
    let _ = host.shutdown.send(true);
}

#[tokio::test]
async fn test_catalog_mismatch_is_refused() {
    let result = scripted_device(|message| match message {
        Message::DeviceInit(_) => Some(Frame::new(device_info(CATALOG_VERSION + 1))),
        other => handshake_reply(&other),
    })
    .await;
    match result {
        Err(ClientError::CatalogMismatch { host, client }) => {
            assert_eq!(host, CATALOG_VERSION + 1);
            assert_eq!(client, CATALOG_VERSION);
        }
        Err(other) => panic!("expected CatalogMismatch, got {}", other),
        Ok(_) => panic!("device accepted a foreign catalog"),
    }
}

// ── Readback registry ───────────────────────────────────────────────────

#[tokio::test]
async fn test_readback_arriving_first_is_kept_until_taken() {
    let registry = ReadbackRegistry::new();
    registry.on_push(Frame::with_blob(UploadDataAndCopy { token: 5, offset: 0 }, vec![1, 2, 3]));
    // Log pushes are re-emitted, not stored.
    registry.on_push(Frame::new(Log { level: 2, target: "host".into(), message: "hi".into() }));

    assert_eq!(registry.wait(5, TIMEOUT).await.expect("arrived"), vec![1, 2, 3]);
    assert_eq!(registry.take(5), None);
}

#[tokio::test]
async fn test_readback_waiter_times_out_then_fails_on_loss() {
    let registry = Arc::new(ReadbackRegistry::new());
    match registry.wait(1, Duration::from_millis(20)).await {
        Err(ClientError::Gfx(GfxError::Timeout(_))) => {}
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!(registry.pending(), 0);

    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.wait(2, TIMEOUT).await })
    };
    while registry.pending() == 0 {
        tokio::task::yield_now().await;
    }
    registry.fail_all();
    assert!(matches!(waiter.await.expect("join"), Err(ClientError::ConnectionLost)));
}
