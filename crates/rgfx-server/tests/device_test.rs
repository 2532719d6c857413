//! Integration test: host device request handling
//!
//! Drives a `HostDevice` on the software backend with the same frames a
//! client channel would deliver: resource creation, batches, baked streams,
//! readback pushes, query pools, swapchains and descriptor updates.
//!
//! Run with: cargo test -p rgfx-server --test device_test

use std::sync::Arc;

use rgfx_core::config::GraphicsConfig;
use rgfx_core::Handle;
use rgfx_protocol::messages::{
    BeginFrame, CmdBufBake, CreateBatch, CreateBuffer, CreateDescriptorSet, CreateQueryPool,
    DescribeResource, DescriptorUpdateFlush, DescriptorWrite, DevToHostCopy, DeviceShutdown,
    EndFrame, HostToDevCopy, LoadPipeline, ReadQueries, ReleaseResource, SkipBatch,
    StagingFrameStat, SubmitBatch, SwapchainAcquire, SwapchainCreate, SwapchainPresent,
    UploadData, WaitAll, WaitBatch, WaitNextFrame,
};
use rgfx_protocol::records::write_record;
use rgfx_protocol::types::{
    BufferDesc, BufferUsage, PipelineStages, PixelFormat, QueryKind, ResourceState,
};
use rgfx_protocol::{
    Frame, Message, ProtocolError, QueueType, Record, RemoteId, ResourceType, CATALOG_VERSION,
};
use rgfx_server::{Dispatched, GpuBackend, HostDevice, SoftwareBackend, SoftwareConfig};

// ── Helpers ─────────────────────────────────────────────────────────────

fn device() -> (Arc<SoftwareBackend>, HostDevice) {
    let backend = Arc::new(SoftwareBackend::new(SoftwareConfig::default()));
    let dyn_backend: Arc<dyn GpuBackend> = backend.clone();
    let device = HostDevice::new(dyn_backend, &GraphicsConfig::default(), "test-host");
    (backend, device)
}

fn call(device: &HostDevice, msg: impl Into<Message>) -> Message {
    device.dispatch(Frame::new(msg)).response.message
}

fn assert_ok(msg: Message) {
    match msg {
        Message::DefaultResponse(r) => assert!(r.ok, "request reported failure"),
        other => panic!("expected DefaultResponse, got {:?}", other),
    }
}

fn created(msg: Message) -> RemoteId {
    match msg {
        Message::ResourceCreated(c) => c.id,
        other => panic!("expected ResourceCreated, got {:?}", other),
    }
}

fn buffer(device: &HostDevice, size: u64) -> RemoteId {
    let id = created(call(
        device,
        CreateBuffer {
            desc: BufferDesc::new(size, BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST),
            label: "test buffer".into(),
        },
    ));
    assert!(id.is_valid());
    id
}

fn open_batch(device: &HostDevice) -> RemoteId {
    match call(
        device,
        CreateBatch { queue: QueueType::Graphics, label: "test".into(), input_deps: vec![] },
    ) {
        Message::BatchCreated(b) => b.batch,
        other => panic!("expected BatchCreated, got {:?}", other),
    }
}

struct Stream {
    records: Vec<Record>,
    payload: Vec<u8>,
    uploads: Vec<HostToDevCopy>,
    readbacks: Vec<DevToHostCopy>,
}

impl Stream {
    fn new(records: Vec<Record>) -> Self {
        Self { records, payload: Vec::new(), uploads: Vec::new(), readbacks: Vec::new() }
    }

    fn upload(mut self, data: &[u8]) -> Self {
        self.uploads.push(HostToDevCopy {
            stream_offset: self.payload.len() as u64,
            size: data.len() as u64,
        });
        self.payload.extend_from_slice(data);
        self
    }

    fn readback(mut self, token: u64, size: u64) -> Self {
        self.readbacks.push(DevToHostCopy { token, size });
        self
    }

    fn frame(self, batch: RemoteId, exe_index: u32) -> Frame {
        let mut blob = Vec::new();
        for record in &self.records {
            write_record(&mut blob, record).expect("encode record");
        }
        let records_size = blob.len() as u64;
        blob.extend_from_slice(&self.payload);
        let bake = CmdBufBake {
            batch,
            exe_index,
            catalog_version: CATALOG_VERSION,
            record_count: self.records.len() as u32,
            block_size: 64 * 1024,
            records_size,
            host_to_dev: self.uploads,
            dev_to_host: self.readbacks,
        };
        Frame::with_blob(bake, blob)
    }
}

fn bake(device: &HostDevice, frame: Frame) -> Dispatched {
    device.dispatch(frame)
}

fn baked_id(dispatched: &Dispatched) -> RemoteId {
    match &dispatched.response.message {
        Message::CmdBufBaked(b) => b.cmdbuf,
        other => panic!("expected CmdBufBaked, got {:?}", other),
    }
}

fn transfer(label: &str) -> Record {
    Record::BeginTransfer { label: label.into() }
}

// ── Bake, submit, readback ──────────────────────────────────────────────

#[test]
fn test_device_info_reports_host_and_catalog() {
    let (_, device) = device();
    let info = device.info();
    assert_eq!(info.host_name, "test-host");
    assert_eq!(info.catalog_version, CATALOG_VERSION);
    assert!(info.supports_timeline);
    assert!(info.max_frames >= 1);
}

#[test]
fn test_bake_submit_and_wait_delivers_readback() {
    let (backend, device) = device();
    call(&device, BeginFrame);
    let buf = buffer(&device, 64);
    let batch = open_batch(&device);

    let upload: Vec<u8> = (1..=16).collect();
    let stream = Stream::new(vec![
        transfer("upload"),
        Record::FillBuffer { buffer: buf, offset: 0, size: 16, data: 0xAABB_CCDD },
        Record::UploadBuffer { payload: 0, buffer: buf, offset: 16 },
        Record::ReadbackBuffer { readback: 0, buffer: buf, offset: 0 },
    ])
    .upload(&upload)
    .readback(9, 32);

    let baked = bake(&device, stream.frame(batch, 0));
    assert_eq!(baked.baked, Some(true));
    let cmdbuf = baked_id(&baked);
    assert!(cmdbuf.is_valid());
    assert_eq!(cmdbuf.resource_type, ResourceType::CommandBuffer);

    assert_ok(call(&device, SubmitBatch { batch, immediately: true }));
    let waited = device.dispatch(Frame::new(WaitBatch { batch, timeout_ms: 1000 }));
    assert_ok(waited.response.message);

    let push = waited
        .pushes
        .iter()
        .find(|f| matches!(f.message, Message::UploadDataAndCopy(_)))
        .expect("readback pushed");
    match &push.message {
        Message::UploadDataAndCopy(p) => assert_eq!(p.token, 9),
        _ => unreachable!(),
    }
    let mut expected: Vec<u8> = [0xDD, 0xCC, 0xBB, 0xAA].repeat(4);
    expected.extend_from_slice(&upload);
    assert_eq!(push.blob, expected);

    let contents = backend.read_buffer(Handle::from(buf), 0, 32).expect("read buffer");
    assert_eq!(contents, expected);
    assert_eq!(backend.op_count("FillBuffer"), 1);
    assert!(backend.submission_count() >= 1);
}

#[test]
fn test_readback_is_delivered_by_wait_all() {
    let (_, device) = device();
    call(&device, BeginFrame);
    let buf = buffer(&device, 16);
    let batch = open_batch(&device);

    let stream = Stream::new(vec![
        transfer("rb"),
        Record::FillBuffer { buffer: buf, offset: 0, size: 16, data: 7 },
        Record::ReadbackBuffer { readback: 0, buffer: buf, offset: 0 },
    ])
    .readback(3, 16);
    assert!(baked_id(&bake(&device, stream.frame(batch, 0))).is_valid());
    assert_ok(call(&device, SubmitBatch { batch, immediately: false }));
    call(&device, EndFrame);

    let waited = device.dispatch(Frame::new(WaitAll { timeout_ms: 1000 }));
    assert_ok(waited.response.message);
    let blobs: Vec<&Frame> = waited
        .pushes
        .iter()
        .filter(|f| matches!(f.message, Message::UploadDataAndCopy(_)))
        .collect();
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].blob, 7u32.to_le_bytes().repeat(4));
}

#[test]
fn test_frames_begin_end_and_retire() {
    let (_, device) = device();
    let first = match call(&device, BeginFrame) {
        Message::FrameBegun(f) => f.frame,
        other => panic!("expected FrameBegun, got {:?}", other),
    };
    match call(&device, EndFrame) {
        Message::FrameEnded(e) => assert_eq!(e.frame, first),
        other => panic!("expected FrameEnded, got {:?}", other),
    }
    match call(&device, WaitNextFrame { timeout_ms: 1000 }) {
        Message::FrameWaited(w) => assert!(w.ok),
        other => panic!("expected FrameWaited, got {:?}", other),
    }
}

// ── Bake failures ───────────────────────────────────────────────────────

#[test]
fn test_kind_mismatch_fails_bake_and_leaves_batch_usable() {
    let (_, device) = device();
    call(&device, BeginFrame);
    let buf = buffer(&device, 16);
    let batch = open_batch(&device);

    let bad = Stream::new(vec![
        Record::BeginCompute { label: "wrong".into() },
        Record::FillBuffer { buffer: buf, offset: 0, size: 16, data: 1 },
    ]);
    let failed = bake(&device, bad.frame(batch, 0));
    assert_eq!(failed.baked, Some(false));
    assert!(!baked_id(&failed).is_valid());
    assert!(
        failed.pushes.iter().any(|f| matches!(&f.message, Message::Log(l) if l.level == 1)),
        "bake failure is reported as a warning push"
    );

    let good = Stream::new(vec![
        transfer("retry"),
        Record::FillBuffer { buffer: buf, offset: 0, size: 16, data: 1 },
    ]);
    assert!(baked_id(&bake(&device, good.frame(batch, 0))).is_valid());
    assert_ok(call(&device, SubmitBatch { batch, immediately: true }));
    assert_ok(call(&device, WaitBatch { batch, timeout_ms: 1000 }));
}

#[test]
fn test_stale_handle_fails_bake() {
    let (_, device) = device();
    call(&device, BeginFrame);
    let buf = buffer(&device, 16);
    let batch = open_batch(&device);

    let stale = RemoteId::new(buf.index, buf.generation + 1, ResourceType::Buffer);
    let stream = Stream::new(vec![
        transfer("stale"),
        Record::FillBuffer { buffer: stale, offset: 0, size: 4, data: 0 },
    ]);
    let failed = bake(&device, stream.frame(batch, 0));
    assert_eq!(failed.baked, Some(false));
    assert!(!baked_id(&failed).is_valid());
}

#[test]
fn test_catalog_version_and_record_count_are_checked() {
    let (_, device) = device();
    call(&device, BeginFrame);
    let buf = buffer(&device, 16);
    let batch = open_batch(&device);
    let records = vec![transfer("v"), Record::FillBuffer { buffer: buf, offset: 0, size: 4, data: 0 }];

    let mut frame = Stream::new(records.clone()).frame(batch, 0);
    if let Message::CmdBufBake(b) = &mut frame.message {
        b.catalog_version = CATALOG_VERSION + 1;
    }
    assert!(!baked_id(&bake(&device, frame)).is_valid());

    let mut frame = Stream::new(records).frame(batch, 0);
    if let Message::CmdBufBake(b) = &mut frame.message {
        b.record_count += 1;
    }
    assert!(!baked_id(&bake(&device, frame)).is_valid());
}

#[test]
fn test_uncommitted_barriers_fail_the_segment() {
    let (_, device) = device();
    call(&device, BeginFrame);
    let buf = buffer(&device, 16);
    let batch = open_batch(&device);

    let pending = Stream::new(vec![
        transfer("barriers"),
        Record::BufferBarrier { buffer: buf, src: ResourceState::CopyDst, dst: ResourceState::CopySrc },
    ]);
    assert!(!baked_id(&bake(&device, pending.frame(batch, 0))).is_valid());

    let committed = Stream::new(vec![
        transfer("barriers"),
        Record::BufferBarrier { buffer: buf, src: ResourceState::CopyDst, dst: ResourceState::CopySrc },
        Record::CommitBarriers,
    ]);
    assert!(baked_id(&bake(&device, committed.frame(batch, 0))).is_valid());
}

#[test]
fn test_skipped_batch_drops_its_readbacks() {
    let (_, device) = device();
    call(&device, BeginFrame);
    let buf = buffer(&device, 16);
    let batch = open_batch(&device);
    let stream = Stream::new(vec![
        transfer("skip"),
        Record::ReadbackBuffer { readback: 0, buffer: buf, offset: 0 },
    ])
    .readback(11, 16);
    assert!(baked_id(&bake(&device, stream.frame(batch, 0))).is_valid());

    assert_ok(call(&device, SkipBatch { batch }));
    let waited = device.dispatch(Frame::new(WaitAll { timeout_ms: 1000 }));
    assert!(waited.pushes.iter().all(|f| !matches!(f.message, Message::UploadDataAndCopy(_))));
}

// ── Resources ───────────────────────────────────────────────────────────

#[test]
fn test_upload_data_writes_buffer_directly() {
    let (backend, device) = device();
    let buf = buffer(&device, 8);
    let reply = device.dispatch(Frame::with_blob(UploadData { buffer: buf, offset: 4 }, vec![1, 2, 3, 4]));
    assert_ok(reply.response.message);
    assert_eq!(backend.read_buffer(Handle::from(buf), 0, 8).expect("read"), vec![0, 0, 0, 0, 1, 2, 3, 4]);
}

#[test]
fn test_failed_creation_returns_invalid_id() {
    let (_, device) = device();
    let id = created(call(
        &device,
        CreateBuffer { desc: BufferDesc::new(0, BufferUsage::TRANSFER_DST), label: "empty".into() },
    ));
    assert!(!id.is_valid());
}

#[test]
fn test_release_and_describe() {
    let (_, device) = device();
    let buf = buffer(&device, 32);
    match call(&device, DescribeResource { id: buf }) {
        Message::ResourceDescription(d) => {
            assert!(d.alive);
            assert_eq!(d.label, "test buffer");
            assert_eq!(d.buffer.map(|b| b.size), Some(32));
        }
        other => panic!("expected ResourceDescription, got {:?}", other),
    }
    assert_eq!(device.resource_count(), 1);
    assert_ok(call(&device, ReleaseResource { id: buf }));
    assert_eq!(device.resource_count(), 0);
    match call(&device, ReleaseResource { id: buf }) {
        Message::DefaultResponse(r) => assert!(!r.ok),
        other => panic!("expected DefaultResponse, got {:?}", other),
    }
}

#[test]
fn test_query_pool_collects_timestamps() {
    let (_, device) = device();
    call(&device, BeginFrame);
    let pool = created(call(&device, CreateQueryPool { kind: QueryKind::Timestamp, count: 4 }));
    assert!(pool.is_valid());
    let batch = open_batch(&device);
    let stream = Stream::new(vec![
        transfer("ts"),
        Record::WriteTimestamp { query_pool: pool, index: 1, stage: PipelineStages::TRANSFER.bits() },
    ]);
    assert!(baked_id(&bake(&device, stream.frame(batch, 0))).is_valid());
    assert_ok(call(&device, SubmitBatch { batch, immediately: true }));
    assert_ok(call(&device, WaitBatch { batch, timeout_ms: 1000 }));

    match call(&device, ReadQueries { pool, first: 0, count: 4 }) {
        Message::QueryResults(r) => {
            assert_eq!(r.values.len(), 4);
            assert_eq!(r.values[0], 0);
            assert!(r.values[1] > 0);
        }
        other => panic!("expected QueryResults, got {:?}", other),
    }
    assert!(matches!(
        call(&device, ReadQueries { pool, first: 3, count: 2 }),
        Message::ErrorResponse(_)
    ));
}

#[test]
fn test_swapchain_acquire_and_present() {
    let (backend, device) = device();
    let created = match call(
        &device,
        SwapchainCreate { width: 32, height: 32, format: PixelFormat::BGRA8Unorm, image_count: 2 },
    ) {
        Message::SwapchainCreated(c) => c,
        other => panic!("expected SwapchainCreated, got {:?}", other),
    };
    assert_eq!(created.images.len(), 2);

    let first = match call(&device, SwapchainAcquire { swapchain: created.swapchain }) {
        Message::SwapchainAcquired(a) => a,
        other => panic!("expected SwapchainAcquired, got {:?}", other),
    };
    assert_eq!(first.image_index, 0);
    assert_eq!(first.image, created.images[0]);

    assert_ok(call(
        &device,
        SwapchainPresent { swapchain: created.swapchain, image_index: first.image_index, wait: None },
    ));
    assert_eq!(backend.op_count("Present"), 1);
}

#[test]
fn test_descriptor_flush_resolves_resources() {
    let (_, device) = device();
    let pipeline = created(call(&device, LoadPipeline { name: "blit".into() }));
    let set = created(call(&device, CreateDescriptorSet { pipeline, set_index: 0 }));
    assert!(set.is_valid());
    let buf = buffer(&device, 64);

    let write = |resource| DescriptorWrite { binding: 0, element: 0, resource, offset: 0, size: 64 };
    assert_ok(call(&device, DescriptorUpdateFlush { set, writes: vec![write(buf)] }));

    let stale = RemoteId::new(buf.index, buf.generation + 1, ResourceType::Buffer);
    assert!(matches!(
        call(&device, DescriptorUpdateFlush { set, writes: vec![write(stale)] }),
        Message::ErrorResponse(_)
    ));
}

#[test]
fn test_staging_stat_counts_bake_uploads() {
    let (_, device) = device();
    call(&device, BeginFrame);
    let buf = buffer(&device, 64);
    let batch = open_batch(&device);
    let stream = Stream::new(vec![
        transfer("stat"),
        Record::UploadBuffer { payload: 0, buffer: buf, offset: 0 },
    ])
    .upload(&[5u8; 48]);
    assert!(baked_id(&bake(&device, stream.frame(batch, 0))).is_valid());

    match call(&device, StagingFrameStat) {
        Message::StagingStat(s) => assert!(s.dynamic_write + s.static_write >= 48),
        other => panic!("expected StagingStat, got {:?}", other),
    }
}

// ── Lifecycle ───────────────────────────────────────────────────────────

#[test]
fn test_shutdown_releases_leftovers_and_rejects_requests() {
    let (_, device) = device();
    buffer(&device, 16);
    buffer(&device, 16);
    assert_ok(call(&device, DeviceShutdown));
    assert!(device.is_shut_down());
    assert_eq!(device.resource_count(), 0);
    assert_eq!(device.shutdown(), 0);

    match call(&device, BeginFrame) {
        Message::ErrorResponse(e) => assert!(matches!(e.error, ProtocolError::Validation(_))),
        other => panic!("expected ErrorResponse, got {:?}", other),
    }
}

#[test]
fn test_unsupported_request_is_an_error() {
    let (_, device) = device();
    match call(&device, rgfx_protocol::messages::Ping) {
        Message::ErrorResponse(e) => {
            assert!(matches!(e.error, ProtocolError::UnsupportedMessage(_)))
        }
        other => panic!("expected ErrorResponse, got {:?}", other),
    }
}
