//! Integration test: baked stream replay
//!
//! Feeds hand-built `CmdBufBake` streams to `ReplayExecutor` over a call-log
//! mock context factory and an in-memory staging heap. Checks that calls
//! reach the native contexts in capture order, that uploads and readbacks
//! flow through staging, and that every failure discards the command buffer.
//!
//! Run with: cargo test -p rgfx-server --test replay_test

use std::sync::Arc;

use parking_lot::Mutex;

use rgfx_core::context::{
    AsBuildContext, CommandContext, ComputeContext, ContextFactory, DrawContext, GeometryBuild,
    GraphicsContext, RayTracingContext, RenderPassDesc, SceneBuild, TransferContext,
};
use rgfx_core::staging::{
    MappedMemory, StagingBuffer, StagingConfig, StagingDirection, StagingMemory,
};
use rgfx_core::{
    Barrier, BarrierSink, FrameId, GfxError, Handle, HandleRegistry, HandleValidator,
    StagingBufferManager, StagingRange,
};
use rgfx_protocol::messages::{CmdBufBake, DevToHostCopy, HostToDevCopy};
use rgfx_protocol::records::{write_record, AttachmentRecord};
use rgfx_protocol::types::{
    BufferCopy, BufferImageCopy, ImageCopy, ImageSubresourceRange, IndexType, PipelineStages,
    Rect2, ResourceState, ShaderStages, Viewport,
};
use rgfx_protocol::{ContextKind, QueueType, Record, RemoteId, ResourceType, CATALOG_VERSION};
use rgfx_server::replay::{BakeRequest, Baked, ReplayExecutor};

// ── Call-log contexts ───────────────────────────────────────────────────

#[derive(Default)]
struct CallLog {
    lines: Mutex<Vec<String>>,
    uploaded: Mutex<Vec<u8>>,
}

impl CallLog {
    fn push(&self, line: String) {
        self.lines.lock().push(line);
    }

    fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

struct MockContexts {
    log: Arc<CallLog>,
    cmdbufs: HandleRegistry<()>,
}

struct LogContext<'a> {
    log: &'a CallLog,
    kind: ContextKind,
}

impl LogContext<'_> {
    fn push(&self, line: String) {
        self.log.push(line);
    }
}

impl ContextFactory for MockContexts {
    fn begin_command_buffer(&self, queue: QueueType, label: &str) -> Result<Handle, GfxError> {
        self.log.push(format!("begin {:?} {}", queue, label));
        Ok(self.cmdbufs.allocate(ResourceType::CommandBuffer, ()))
    }

    fn transfer(&self, _cmdbuf: Handle) -> Result<Box<dyn TransferContext + '_>, GfxError> {
        self.log.push("open Transfer".into());
        Ok(Box::new(LogContext { log: &self.log, kind: ContextKind::Transfer }))
    }

    fn compute(&self, _cmdbuf: Handle) -> Result<Box<dyn ComputeContext + '_>, GfxError> {
        self.log.push("open Compute".into());
        Ok(Box::new(LogContext { log: &self.log, kind: ContextKind::Compute }))
    }

    fn graphics(&self, _cmdbuf: Handle) -> Result<Box<dyn GraphicsContext + '_>, GfxError> {
        self.log.push("open Graphics".into());
        Ok(Box::new(LogContext { log: &self.log, kind: ContextKind::Graphics }))
    }

    fn as_build(&self, _cmdbuf: Handle) -> Result<Box<dyn AsBuildContext + '_>, GfxError> {
        self.log.push("open AsBuild".into());
        Ok(Box::new(LogContext { log: &self.log, kind: ContextKind::AsBuild }))
    }

    fn ray_tracing(&self, _cmdbuf: Handle) -> Result<Box<dyn RayTracingContext + '_>, GfxError> {
        self.log.push("open RayTracing".into());
        Ok(Box::new(LogContext { log: &self.log, kind: ContextKind::RayTracing }))
    }

    fn end_command_buffer(&self, _cmdbuf: Handle) -> Result<(), GfxError> {
        self.log.push("end".into());
        Ok(())
    }

    fn discard_command_buffer(&self, cmdbuf: Handle) {
        self.log.push("discard".into());
        self.cmdbufs.release(cmdbuf);
    }
}

impl BarrierSink for LogContext<'_> {
    fn commit_barriers(&mut self, barriers: &[Barrier]) {
        self.push(format!("barriers {}", barriers.len()));
    }
}

impl CommandContext for LogContext<'_> {
    fn kind(&self) -> ContextKind {
        self.kind
    }

    fn debug_marker(&mut self, label: &str, _color: u32) {
        self.push(format!("marker {}", label));
    }

    fn push_debug_group(&mut self, label: &str, _color: u32) {
        self.push(format!("push_group {}", label));
    }

    fn pop_debug_group(&mut self) {
        self.push("pop_group".into());
    }

    fn write_timestamp(&mut self, query_pool: Handle, index: u32, _stage: PipelineStages) {
        self.push(format!("timestamp {} {}", query_pool, index));
    }

    fn finish(&mut self) -> Result<(), GfxError> {
        self.push(format!("finish {:?}", self.kind));
        Ok(())
    }
}

impl TransferContext for LogContext<'_> {
    fn clear_color_image(&mut self, image: Handle, _color: [f32; 4], _ranges: &[ImageSubresourceRange]) {
        self.push(format!("clear_color {}", image));
    }

    fn clear_depth_stencil_image(
        &mut self,
        image: Handle,
        _depth: f32,
        _stencil: u32,
        _ranges: &[ImageSubresourceRange],
    ) {
        self.push(format!("clear_depth {}", image));
    }

    fn fill_buffer(&mut self, buffer: Handle, offset: u64, size: u64, data: u32) {
        self.push(format!("fill {} {} {} {:#x}", buffer, offset, size, data));
    }

    fn update_buffer(&mut self, buffer: Handle, offset: u64, data: &[u8]) {
        self.push(format!("update {} {} {}", buffer, offset, data.len()));
    }

    fn copy_buffer(&mut self, src: Handle, dst: Handle, regions: &[BufferCopy]) {
        self.push(format!("copy_buffer {} {} {}", src, dst, regions.len()));
    }

    fn copy_image(&mut self, src: Handle, dst: Handle, _regions: &[ImageCopy]) {
        self.push(format!("copy_image {} {}", src, dst));
    }

    fn copy_buffer_to_image(&mut self, src: Handle, dst: Handle, _regions: &[BufferImageCopy]) {
        self.push(format!("buffer_to_image {} {}", src, dst));
    }

    fn copy_image_to_buffer(&mut self, src: Handle, dst: Handle, _regions: &[BufferImageCopy]) {
        self.push(format!("image_to_buffer {} {}", src, dst));
    }

    fn generate_mipmaps(&mut self, image: Handle) {
        self.push(format!("mipmaps {}", image));
    }

    fn copy_from_staging(&mut self, src: &StagingRange, dst: Handle, dst_offset: u64) {
        if let Ok(bytes) = src.read(0, src.size as usize) {
            self.log.uploaded.lock().extend_from_slice(&bytes);
        }
        self.push(format!("from_staging {} {}", dst, dst_offset));
    }

    fn copy_to_staging(&mut self, src: Handle, src_offset: u64, dst: &StagingRange) {
        let _ = dst.write(0, &vec![0xEE; dst.size as usize]);
        self.push(format!("to_staging {} {}", src, src_offset));
    }
}

impl ComputeContext for LogContext<'_> {
    fn bind_compute_pipeline(&mut self, pipeline: Handle) {
        self.push(format!("bind_compute {}", pipeline));
    }

    fn bind_descriptor_set(&mut self, index: u32, set: Handle, _dynamic_offsets: &[u32]) {
        self.push(format!("bind_set {} {}", index, set));
    }

    fn push_constant(&mut self, offset: u32, _stages: ShaderStages, data: &[u8]) {
        self.push(format!("push_constant {} {}", offset, data.len()));
    }

    fn dispatch(&mut self, group_count: [u32; 3]) {
        self.push(format!("dispatch {:?}", group_count));
    }

    fn dispatch_indirect(&mut self, buffer: Handle, offset: u64) {
        self.push(format!("dispatch_indirect {} {}", buffer, offset));
    }
}

impl GraphicsContext for LogContext<'_> {
    fn begin_render_pass(&mut self, desc: &RenderPassDesc) {
        self.push(format!("begin_pass {}", desc.attachments.len()));
    }

    fn next_subpass(&mut self) {
        self.push("next_subpass".into());
    }

    fn end_render_pass(&mut self) {
        self.push("end_pass".into());
    }

    fn draw_context(&mut self) -> &mut dyn DrawContext {
        self
    }
}

impl DrawContext for LogContext<'_> {
    fn bind_graphics_pipeline(&mut self, pipeline: Handle) {
        self.push(format!("bind_graphics {}", pipeline));
    }

    fn bind_descriptor_set(&mut self, index: u32, set: Handle, _dynamic_offsets: &[u32]) {
        self.push(format!("bind_set {} {}", index, set));
    }

    fn push_constant(&mut self, offset: u32, _stages: ShaderStages, data: &[u8]) {
        self.push(format!("push_constant {} {}", offset, data.len()));
    }

    fn set_viewport(&mut self, first: u32, viewports: &[Viewport]) {
        self.push(format!("viewport {} {}", first, viewports.len()));
    }

    fn set_scissor(&mut self, first: u32, scissors: &[Rect2]) {
        self.push(format!("scissor {} {}", first, scissors.len()));
    }

    fn set_stencil_reference(&mut self, value: u32) {
        self.push(format!("stencil {}", value));
    }

    fn set_blend_constants(&mut self, _color: [f32; 4]) {
        self.push("blend".into());
    }

    fn bind_index_buffer(&mut self, buffer: Handle, offset: u64, _index_type: IndexType) {
        self.push(format!("index_buffer {} {}", buffer, offset));
    }

    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[Handle], _offsets: &[u64]) {
        self.push(format!("vertex_buffers {} {}", first_binding, buffers.len()));
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.push(format!("draw {} {}", vertex_count, instance_count));
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.push(format!("draw_indexed {} {}", index_count, instance_count));
    }

    fn draw_indirect(&mut self, buffer: Handle, offset: u64, draw_count: u32, _stride: u32) {
        self.push(format!("draw_indirect {} {} {}", buffer, offset, draw_count));
    }

    fn draw_indexed_indirect(&mut self, buffer: Handle, offset: u64, draw_count: u32, _stride: u32) {
        self.push(format!("draw_indexed_indirect {} {} {}", buffer, offset, draw_count));
    }

    fn draw_mesh_tasks(&mut self, group_count: [u32; 3]) {
        self.push(format!("mesh_tasks {:?}", group_count));
    }
}

impl AsBuildContext for LogContext<'_> {
    fn build_geometry(&mut self, build: &GeometryBuild) {
        self.push(format!("build_geometry {}", build.primitive_count));
    }

    fn build_scene(&mut self, build: &SceneBuild) {
        self.push(format!("build_scene {}", build.instance_count));
    }

    fn copy_acceleration_structure(&mut self, src: Handle, dst: Handle, compact: bool) {
        self.push(format!("copy_as {} {} {}", src, dst, compact));
    }

    fn write_compacted_size(&mut self, src: Handle, _query_pool: Handle, index: u32) {
        self.push(format!("compacted_size {} {}", src, index));
    }
}

impl RayTracingContext for LogContext<'_> {
    fn bind_ray_tracing_pipeline(&mut self, pipeline: Handle) {
        self.push(format!("bind_rt {}", pipeline));
    }

    fn bind_descriptor_set(&mut self, index: u32, set: Handle, _dynamic_offsets: &[u32]) {
        self.push(format!("bind_set {} {}", index, set));
    }

    fn push_constant(&mut self, offset: u32, _stages: ShaderStages, data: &[u8]) {
        self.push(format!("push_constant {} {}", offset, data.len()));
    }

    fn set_stack_size(&mut self, bytes: u32) {
        self.push(format!("stack_size {}", bytes));
    }

    fn trace_rays(&mut self, sbt: Handle, dim: [u32; 3]) {
        self.push(format!("trace_rays {} {:?}", sbt, dim));
    }

    fn trace_rays_indirect(&mut self, sbt: Handle, buffer: Handle, offset: u64) {
        self.push(format!("trace_rays_indirect {} {} {}", sbt, buffer, offset));
    }
}

// ── In-memory staging heap ──────────────────────────────────────────────

struct HostMemory {
    handles: HandleRegistry<()>,
}

impl StagingMemory for HostMemory {
    fn create_staging_buffer(
        &self,
        size: u64,
        _direction: StagingDirection,
    ) -> Result<StagingBuffer, GfxError> {
        Ok(StagingBuffer {
            buffer: self.handles.allocate(ResourceType::Buffer, ()),
            capacity: size,
            mapped: MappedMemory::new(size as usize),
        })
    }
}

// ── Fixture ─────────────────────────────────────────────────────────────

struct Fixture {
    log: Arc<CallLog>,
    resources: Arc<HandleRegistry<&'static str>>,
    replay: ReplayExecutor,
}

impl Fixture {
    fn new() -> Self {
        let log = Arc::new(CallLog::default());
        let contexts = Arc::new(MockContexts {
            log: log.clone(),
            cmdbufs: HandleRegistry::new("cmdbufs", 16),
        });
        let resources = Arc::new(HandleRegistry::new("resources", 64));
        let staging = Arc::new(StagingBufferManager::new(
            Arc::new(HostMemory { handles: HandleRegistry::new("staging", 64) }),
            StagingConfig {
                max_frames: 2,
                static_size: 0,
                dynamic_block_size: 4096,
                max_dynamic_size: 64 * 1024,
            },
        ));
        let validator: Arc<dyn HandleValidator> = resources.clone();
        let replay = ReplayExecutor::new(contexts, validator, staging);
        Self { log, resources, replay }
    }

    fn resource(&self, kind: ResourceType, label: &'static str) -> (Handle, RemoteId) {
        let handle = self.resources.allocate(kind, label);
        (handle, RemoteId::from(handle))
    }

    fn bake(&self, stream: &Stream) -> Result<Baked, GfxError> {
        self.bake_header(stream, stream.header())
    }

    fn bake_header(&self, stream: &Stream, bake: CmdBufBake) -> Result<Baked, GfxError> {
        let blob = stream.blob();
        self.replay.bake(&BakeRequest {
            bake: &bake,
            blob: &blob,
            queue: QueueType::Graphics,
            frame: FrameId::new(1, 2),
            label: "replay-test",
        })
    }
}

#[derive(Default)]
struct Stream {
    records: Vec<u8>,
    count: u32,
    payload: Vec<u8>,
    host_to_dev: Vec<HostToDevCopy>,
    dev_to_host: Vec<DevToHostCopy>,
}

impl Stream {
    fn new(records: &[Record]) -> Self {
        let mut stream = Self::default();
        for record in records {
            write_record(&mut stream.records, record).expect("encode");
            stream.count += 1;
        }
        stream
    }

    fn upload(mut self, data: &[u8]) -> Self {
        self.host_to_dev.push(HostToDevCopy {
            stream_offset: self.payload.len() as u64,
            size: data.len() as u64,
        });
        self.payload.extend_from_slice(data);
        self
    }

    fn readback(mut self, token: u64, size: u64) -> Self {
        self.dev_to_host.push(DevToHostCopy { token, size });
        self
    }

    fn header(&self) -> CmdBufBake {
        CmdBufBake {
            batch: RemoteId::invalid(),
            exe_index: 0,
            catalog_version: CATALOG_VERSION,
            record_count: self.count,
            block_size: 16,
            records_size: self.records.len() as u64,
            host_to_dev: self.host_to_dev.clone(),
            dev_to_host: self.dev_to_host.clone(),
        }
    }

    fn blob(&self) -> Vec<u8> {
        let mut blob = self.records.clone();
        blob.extend_from_slice(&self.payload);
        blob
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[test]
fn test_round_trip_reaches_contexts_in_capture_order() {
    let fx = Fixture::new();
    let (src, src_id) = fx.resource(ResourceType::Buffer, "src");
    let (dst, dst_id) = fx.resource(ResourceType::Buffer, "dst");
    let (pipeline, pipeline_id) = fx.resource(ResourceType::Pipeline, "pipeline");
    let (_, target_id) = fx.resource(ResourceType::Image, "target");

    let stream = Stream::new(&[
        Record::BeginTransfer { label: "copy".into() },
        Record::DebugMarker { label: "m".into(), color: 0 },
        Record::BufferBarrier { buffer: src_id, src: ResourceState::Unknown, dst: ResourceState::CopyDst },
        Record::CommitBarriers,
        Record::FillBuffer { buffer: src_id, offset: 0, size: 16, data: 7 },
        Record::CopyBuffer {
            src: src_id,
            dst: dst_id,
            regions: vec![BufferCopy { src_offset: 0, dst_offset: 0, size: 16 }],
        },
        Record::BeginCompute { label: "cs".into() },
        Record::BindComputePipeline { pipeline: pipeline_id },
        Record::PushConstant { offset: 0, stages: ShaderStages::COMPUTE.bits(), data: vec![1, 2] },
        Record::Dispatch { group_count: [4, 1, 1] },
        Record::BeginGraphics { label: "gfx".into() },
        Record::BeginRenderPass {
            attachments: vec![AttachmentRecord {
                image: target_id,
                clear: None,
                initial: ResourceState::Unknown,
                final_state: ResourceState::ColorAttachment,
            }],
            area: Rect2 { x: 0, y: 0, width: 8, height: 8 },
            layer_count: 1,
        },
        Record::BindGraphicsPipeline { pipeline: pipeline_id },
        Record::Draw { vertex_count: 3, instance_count: 1, first_vertex: 0, first_instance: 0 },
        Record::EndRenderPass,
    ]);

    let baked = fx.bake(&stream).expect("bake");
    assert_eq!(baked.records, 15);
    assert!(baked.cmdbuf.is_valid());
    assert!(baked.readbacks.is_empty());

    let expected = vec![
        "begin Graphics replay-test".to_string(),
        "open Transfer".into(),
        "marker m".into(),
        "barriers 1".into(),
        format!("fill {} 0 16 0x7", src),
        format!("copy_buffer {} {} 1", src, dst),
        "finish Transfer".into(),
        "open Compute".into(),
        format!("bind_compute {}", pipeline),
        "push_constant 0 2".into(),
        "dispatch [4, 1, 1]".into(),
        "finish Compute".into(),
        "open Graphics".into(),
        "begin_pass 1".into(),
        format!("bind_graphics {}", pipeline),
        "draw 3 1".into(),
        "end_pass".into(),
        "finish Graphics".into(),
        "end".into(),
    ];
    assert_eq!(fx.log.lines(), expected);
}

#[test]
fn test_uploads_and_readbacks_flow_through_staging() {
    let fx = Fixture::new();
    let (buffer, id) = fx.resource(ResourceType::Buffer, "buffer");
    let payload: Vec<u8> = (0..40).collect();

    let stream = Stream::new(&[
        Record::BeginTransfer { label: "io".into() },
        Record::UploadBuffer { payload: 0, buffer: id, offset: 8 },
        Record::ReadbackBuffer { readback: 0, buffer: id, offset: 4 },
    ])
    .upload(&payload)
    .readback(77, 24);

    let baked = fx.bake(&stream).expect("bake");
    assert_eq!(*fx.log.uploaded.lock(), payload);

    let lines = fx.log.lines();
    assert!(lines.contains(&format!("from_staging {} 8", buffer)), "{:?}", lines);
    assert!(lines.contains(&format!("to_staging {} 4", buffer)), "{:?}", lines);

    assert_eq!(baked.readbacks.len(), 1);
    let readback = &baked.readbacks[0];
    assert_eq!(readback.token, 77);
    assert_eq!(readback.size(), 24);
    assert_eq!(readback.collect().expect("collect"), vec![0xEE; 24]);
}

#[test]
fn test_kind_mismatch_discards_the_command_buffer() {
    let fx = Fixture::new();
    let stream = Stream::new(&[
        Record::BeginTransfer { label: "t".into() },
        Record::Dispatch { group_count: [1, 1, 1] },
    ]);
    match fx.bake(&stream) {
        Err(GfxError::KindMismatch { record: "Dispatch", active: ContextKind::Transfer }) => {}
        other => panic!("expected a kind mismatch, got {:?}", other.map(|b| b.records)),
    }
    let lines = fx.log.lines();
    assert_eq!(lines.last().map(String::as_str), Some("discard"));
    assert!(!lines.iter().any(|l| l == "end"));
}

#[test]
fn test_stale_handle_fails_replay() {
    let fx = Fixture::new();
    let (buffer, id) = fx.resource(ResourceType::Buffer, "gone");
    assert!(fx.resources.release(buffer));
    let stream = Stream::new(&[
        Record::BeginTransfer { label: "t".into() },
        Record::FillBuffer { buffer: id, offset: 0, size: 4, data: 0 },
    ]);
    assert!(matches!(fx.bake(&stream), Err(GfxError::StaleHandle(h)) if h == buffer));
    assert_eq!(fx.log.lines().last().map(String::as_str), Some("discard"));
}

#[test]
fn test_uncommitted_barriers_and_open_render_passes_fail() {
    let fx = Fixture::new();
    let (_, id) = fx.resource(ResourceType::Buffer, "b");
    let (_, image) = fx.resource(ResourceType::Image, "i");

    let pending = Stream::new(&[
        Record::BeginTransfer { label: "t".into() },
        Record::BufferBarrier { buffer: id, src: ResourceState::CopyDst, dst: ResourceState::CopySrc },
        Record::BeginCompute { label: "c".into() },
    ]);
    assert!(matches!(fx.bake(&pending), Err(GfxError::Validation(_))));

    let open_pass = Stream::new(&[
        Record::BeginGraphics { label: "g".into() },
        Record::BeginRenderPass {
            attachments: vec![AttachmentRecord {
                image,
                clear: None,
                initial: ResourceState::Unknown,
                final_state: ResourceState::ColorAttachment,
            }],
            area: Rect2::default(),
            layer_count: 1,
        },
    ]);
    assert!(fx.bake(&open_pass).is_err());
    // A segment begin is not allowed inside a render pass either.
    let begin_in_pass = Stream::new(&[
        Record::BeginGraphics { label: "g".into() },
        Record::BeginRenderPass { attachments: vec![], area: Rect2::default(), layer_count: 1 },
        Record::BeginTransfer { label: "t".into() },
    ]);
    assert!(matches!(fx.bake(&begin_in_pass), Err(GfxError::KindMismatch { .. })));
}

#[test]
fn test_header_errors_are_caught_before_recording() {
    let fx = Fixture::new();
    let stream = Stream::new(&[Record::BeginTransfer { label: "t".into() }]).upload(&[1, 2, 3, 4]);

    let mut foreign = stream.header();
    foreign.catalog_version = CATALOG_VERSION + 1;
    assert!(matches!(fx.bake_header(&stream, foreign), Err(GfxError::Protocol(_))));

    let mut oversized = stream.header();
    oversized.records_size = 1 << 20;
    assert!(matches!(fx.bake_header(&stream, oversized), Err(GfxError::Validation(_))));

    let mut outside = stream.header();
    outside.host_to_dev[0].size = 64;
    assert!(matches!(fx.bake_header(&stream, outside), Err(GfxError::Validation(_))));

    assert!(fx.log.lines().is_empty(), "no command buffer may be opened");

    let mut miscounted = stream.header();
    miscounted.record_count = 2;
    assert!(matches!(fx.bake_header(&stream, miscounted), Err(GfxError::Validation(_))));
    assert_eq!(fx.log.lines().last().map(String::as_str), Some("discard"));
}
