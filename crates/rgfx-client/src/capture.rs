//! Command capture.
//!
//! `CaptureRecorder` implements every context capability trait by turning
//! each call into a `Record`, translating local handles to host ids on the
//! way. Records are length-prefixed into a block arena; bulk upload data
//! goes to a separate payload arena referenced through the host→device
//! table. The first error is latched and every later call becomes a no-op;
//! it surfaces from `finish()` or `into_stream()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use rgfx_core::barrier::QueueTransfer;
use rgfx_core::context::{
    AsBuildContext, CommandContext, ComputeContext, DrawContext, GeometryBuild, GraphicsContext,
    KindTracker, RayTracingContext, RenderPassDesc, SceneBuild, TransferContext,
};
use rgfx_core::{Barrier, BarrierSink, GfxError, Handle, HandleMap, StagingRange};
use rgfx_protocol::messages::{CmdBufBake, DevToHostCopy, HostToDevCopy};
use rgfx_protocol::records::{write_record, AttachmentRecord};
use rgfx_protocol::types::{
    BufferCopy, BufferImageCopy, ImageCopy, ImageSubresourceRange, IndexType, PipelineStages,
    Rect2, ShaderStages, Viewport,
};
use rgfx_protocol::{ContextKind, Frame, Record, RemoteId, CATALOG_VERSION};

use crate::arena::BlockArena;

pub struct CaptureRecorder {
    map: Arc<HandleMap>,
    records: BlockArena,
    payload: BlockArena,
    scratch: Vec<u8>,
    record_count: u32,
    host_to_dev: Vec<HostToDevCopy>,
    dev_to_host: Vec<DevToHostCopy>,
    tracker: KindTracker,
    error: Option<GfxError>,
    tokens: Arc<AtomicU64>,
}

impl CaptureRecorder {
    /// `tokens` hands out readback tokens; share one counter per connection
    /// so tokens never collide across streams.
    pub fn new(map: Arc<HandleMap>, block_size: usize, tokens: Arc<AtomicU64>) -> Self {
        Self {
            map,
            records: BlockArena::new(block_size),
            payload: BlockArena::new(block_size),
            scratch: Vec::new(),
            record_count: 0,
            host_to_dev: Vec::new(),
            dev_to_host: Vec::new(),
            tracker: KindTracker::new(),
            error: None,
            tokens,
        }
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// First error hit while recording, if any.
    pub fn error(&self) -> Option<&GfxError> {
        self.error.as_ref()
    }

    // ── Segments ────────────────────────────────────────────────────────

    pub fn transfer(&mut self, label: &str) -> &mut dyn TransferContext {
        self.emit(Record::BeginTransfer { label: label.into() });
        self
    }

    pub fn compute(&mut self, label: &str) -> &mut dyn ComputeContext {
        self.emit(Record::BeginCompute { label: label.into() });
        self
    }

    pub fn graphics(&mut self, label: &str) -> &mut dyn GraphicsContext {
        self.emit(Record::BeginGraphics { label: label.into() });
        self
    }

    pub fn as_build(&mut self, label: &str) -> &mut dyn AsBuildContext {
        self.emit(Record::BeginAsBuild { label: label.into() });
        self
    }

    pub fn ray_tracing(&mut self, label: &str) -> &mut dyn RayTracingContext {
        self.emit(Record::BeginRayTracing { label: label.into() });
        self
    }

    // ── Host data ───────────────────────────────────────────────────────

    /// Copy `data` into `buffer` at `offset` when the stream replays. Data
    /// larger than one block is split into several uploads.
    pub fn upload_buffer(&mut self, buffer: Handle, offset: u64, data: &[u8]) {
        let buffer = self.id(buffer);
        if self.error.is_some() {
            return;
        }
        let mut at = offset;
        for (stream_offset, size) in self.payload.write_chunked(data) {
            let Ok(payload) = u32::try_from(self.host_to_dev.len()) else {
                self.latch(GfxError::validation("too many uploads in one stream"));
                return;
            };
            self.host_to_dev.push(HostToDevCopy { stream_offset, size });
            self.emit(Record::UploadBuffer { payload, buffer, offset: at });
            if self.error.is_some() {
                return;
            }
            at += size;
        }
    }

    /// Copy `size` bytes of `buffer` back to the client once the batch
    /// completes. Returns the token the data will arrive under.
    pub fn readback_buffer(&mut self, buffer: Handle, offset: u64, size: u64) -> u64 {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let buffer = self.id(buffer);
        let Ok(readback) = u32::try_from(self.dev_to_host.len()) else {
            self.latch(GfxError::validation("too many readbacks in one stream"));
            return token;
        };
        self.dev_to_host.push(DevToHostCopy { token, size });
        self.emit(Record::ReadbackBuffer { readback, buffer, offset });
        token
    }

    /// Close the stream for baking.
    pub fn into_stream(mut self) -> Result<CapturedStream, GfxError> {
        if self.error.is_none() {
            if let Err(e) = self.tracker.finish() {
                self.latch(e);
            }
        }
        if let Some(e) = self.error {
            return Err(e);
        }

        let records_size = self.records.len();
        let mut blob = Vec::with_capacity((records_size + self.payload.len()) as usize);
        self.records.copy_into(&mut blob);
        self.payload.copy_into(&mut blob);
        debug!(
            records = self.record_count,
            records_size,
            payload = self.payload.len(),
            "stream captured"
        );
        Ok(CapturedStream {
            record_count: self.record_count,
            records_size,
            block_size: u32::try_from(self.records.block_size()).unwrap_or(u32::MAX),
            host_to_dev: self.host_to_dev,
            dev_to_host: self.dev_to_host,
            blob,
        })
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn latch(&mut self, error: GfxError) {
        if self.error.is_none() {
            debug!(error = %error, "capture error latched");
            self.error = Some(error);
        }
    }

    fn id(&mut self, handle: Handle) -> RemoteId {
        match self.map.to_remote(handle) {
            Some(id) => id,
            None => {
                self.latch(GfxError::StaleHandle(handle));
                RemoteId::invalid()
            }
        }
    }

    fn ids(&mut self, handles: &[Handle]) -> Vec<RemoteId> {
        handles.iter().map(|h| self.id(*h)).collect()
    }

    fn emit(&mut self, record: Record) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.tracker.apply(&record) {
            self.latch(e);
            return;
        }
        self.scratch.clear();
        if let Err(e) = write_record(&mut self.scratch, &record) {
            self.latch(GfxError::Protocol(format!("{}: {}", record.name(), e)));
            return;
        }
        self.records.write(&self.scratch);
        self.record_count += 1;
        trace!(record = record.name(), "captured");
    }

    fn bind_set(&mut self, index: u32, set: Handle, dynamic_offsets: &[u32]) {
        let set = self.id(set);
        self.emit(Record::BindDescriptorSet { index, set, dynamic_offsets: dynamic_offsets.to_vec() });
    }

    fn push_bytes(&mut self, offset: u32, stages: ShaderStages, data: &[u8]) {
        self.emit(Record::PushConstant { offset, stages: stages.bits(), data: data.to_vec() });
    }

    fn barrier_record(&mut self, barrier: &Barrier) -> Record {
        match *barrier {
            Barrier::Buffer { buffer, range, src, dst, transfer } => {
                let buffer = self.id(buffer);
                match (transfer, range) {
                    (Some(QueueTransfer::Acquire { from }), _) => {
                        Record::AcquireBufferOwnership { buffer, src_queue: from, src, dst }
                    }
                    (Some(QueueTransfer::Release { to }), _) => {
                        Record::ReleaseBufferOwnership { buffer, dst_queue: to, src, dst }
                    }
                    (None, Some(range)) => Record::BufferRangeBarrier {
                        buffer,
                        offset: range.offset,
                        size: range.size,
                        src,
                        dst,
                    },
                    (None, None) => Record::BufferBarrier { buffer, src, dst },
                }
            }
            Barrier::Image { image, range, src, dst, transfer } => {
                let image = self.id(image);
                match transfer {
                    Some(QueueTransfer::Acquire { from }) => {
                        Record::AcquireImageOwnership { image, src_queue: from, src, dst }
                    }
                    Some(QueueTransfer::Release { to }) => {
                        Record::ReleaseImageOwnership { image, dst_queue: to, src, dst }
                    }
                    None => Record::ImageBarrier { image, range, src, dst },
                }
            }
            Barrier::Memory { src, dst } => Record::MemoryBarrier { src, dst },
            Barrier::Execution { src_stages, dst_stages } => Record::ExecutionBarrier {
                src_stages: src_stages.bits(),
                dst_stages: dst_stages.bits(),
            },
        }
    }
}

/// A finished capture, ready to be sent as one `CmdBufBake`.
#[derive(Debug, Clone)]
pub struct CapturedStream {
    pub record_count: u32,
    pub records_size: u64,
    pub block_size: u32,
    pub host_to_dev: Vec<HostToDevCopy>,
    pub dev_to_host: Vec<DevToHostCopy>,
    /// Records followed by upload payload.
    pub blob: Vec<u8>,
}

impl CapturedStream {
    /// Readback tokens in the order the stream requested them.
    pub fn tokens(&self) -> Vec<u64> {
        self.dev_to_host.iter().map(|copy| copy.token).collect()
    }

    pub fn into_frame(self, batch: RemoteId, exe_index: u32) -> Frame {
        let bake = CmdBufBake {
            batch,
            exe_index,
            catalog_version: CATALOG_VERSION,
            record_count: self.record_count,
            block_size: self.block_size,
            records_size: self.records_size,
            host_to_dev: self.host_to_dev,
            dev_to_host: self.dev_to_host,
        };
        Frame::with_blob(bake, self.blob)
    }
}

// ── Context traits ──────────────────────────────────────────────────────

impl BarrierSink for CaptureRecorder {
    fn commit_barriers(&mut self, barriers: &[Barrier]) {
        for barrier in barriers {
            let record = self.barrier_record(barrier);
            self.emit(record);
        }
        self.emit(Record::CommitBarriers);
    }
}

impl CommandContext for CaptureRecorder {
    fn kind(&self) -> ContextKind {
        self.tracker.active()
    }

    fn debug_marker(&mut self, label: &str, color: u32) {
        self.emit(Record::DebugMarker { label: label.into(), color });
    }

    fn push_debug_group(&mut self, label: &str, color: u32) {
        self.emit(Record::PushDebugGroup { label: label.into(), color });
    }

    fn pop_debug_group(&mut self) {
        self.emit(Record::PopDebugGroup);
    }

    fn write_timestamp(&mut self, query_pool: Handle, index: u32, stage: PipelineStages) {
        let query_pool = self.id(query_pool);
        self.emit(Record::WriteTimestamp { query_pool, index, stage: stage.bits() });
    }

    fn finish(&mut self) -> Result<(), GfxError> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl TransferContext for CaptureRecorder {
    fn clear_color_image(&mut self, image: Handle, color: [f32; 4], ranges: &[ImageSubresourceRange]) {
        let image = self.id(image);
        self.emit(Record::ClearColorImage { image, color, ranges: ranges.to_vec() });
    }

    fn clear_depth_stencil_image(
        &mut self,
        image: Handle,
        depth: f32,
        stencil: u32,
        ranges: &[ImageSubresourceRange],
    ) {
        let image = self.id(image);
        self.emit(Record::ClearDepthStencilImage { image, depth, stencil, ranges: ranges.to_vec() });
    }

    fn fill_buffer(&mut self, buffer: Handle, offset: u64, size: u64, data: u32) {
        let buffer = self.id(buffer);
        self.emit(Record::FillBuffer { buffer, offset, size, data });
    }

    fn update_buffer(&mut self, buffer: Handle, offset: u64, data: &[u8]) {
        let buffer = self.id(buffer);
        self.emit(Record::UpdateBuffer { buffer, offset, data: data.to_vec() });
    }

    fn copy_buffer(&mut self, src: Handle, dst: Handle, regions: &[BufferCopy]) {
        let (src, dst) = (self.id(src), self.id(dst));
        self.emit(Record::CopyBuffer { src, dst, regions: regions.to_vec() });
    }

    fn copy_image(&mut self, src: Handle, dst: Handle, regions: &[ImageCopy]) {
        let (src, dst) = (self.id(src), self.id(dst));
        self.emit(Record::CopyImage { src, dst, regions: regions.to_vec() });
    }

    fn copy_buffer_to_image(&mut self, src: Handle, dst: Handle, regions: &[BufferImageCopy]) {
        let (src, dst) = (self.id(src), self.id(dst));
        self.emit(Record::CopyBufferToImage { src, dst, regions: regions.to_vec() });
    }

    fn copy_image_to_buffer(&mut self, src: Handle, dst: Handle, regions: &[BufferImageCopy]) {
        let (src, dst) = (self.id(src), self.id(dst));
        self.emit(Record::CopyImageToBuffer { src, dst, regions: regions.to_vec() });
    }

    fn generate_mipmaps(&mut self, image: Handle) {
        let image = self.id(image);
        self.emit(Record::GenerateMipmaps { image });
    }

    // Staging ranges live in host memory; remote streams move bytes with
    // upload_buffer and readback_buffer instead.
    fn copy_from_staging(&mut self, _src: &StagingRange, _dst: Handle, _dst_offset: u64) {
        self.latch(GfxError::validation("staging ranges cannot be captured; use upload_buffer"));
    }

    fn copy_to_staging(&mut self, _src: Handle, _src_offset: u64, _dst: &StagingRange) {
        self.latch(GfxError::validation("staging ranges cannot be captured; use readback_buffer"));
    }
}

impl ComputeContext for CaptureRecorder {
    fn bind_compute_pipeline(&mut self, pipeline: Handle) {
        let pipeline = self.id(pipeline);
        self.emit(Record::BindComputePipeline { pipeline });
    }

    fn bind_descriptor_set(&mut self, index: u32, set: Handle, dynamic_offsets: &[u32]) {
        self.bind_set(index, set, dynamic_offsets);
    }

    fn push_constant(&mut self, offset: u32, stages: ShaderStages, data: &[u8]) {
        self.push_bytes(offset, stages, data);
    }

    fn dispatch(&mut self, group_count: [u32; 3]) {
        self.emit(Record::Dispatch { group_count });
    }

    fn dispatch_indirect(&mut self, buffer: Handle, offset: u64) {
        let buffer = self.id(buffer);
        self.emit(Record::DispatchIndirect { buffer, offset });
    }
}

impl GraphicsContext for CaptureRecorder {
    fn begin_render_pass(&mut self, desc: &RenderPassDesc) {
        let attachments = desc
            .attachments
            .iter()
            .map(|a| AttachmentRecord {
                image: self.id(a.image),
                clear: a.clear,
                initial: a.initial,
                final_state: a.final_state,
            })
            .collect();
        self.emit(Record::BeginRenderPass {
            attachments,
            area: desc.area,
            layer_count: desc.layer_count,
        });
    }

    fn next_subpass(&mut self) {
        self.emit(Record::NextSubpass);
    }

    fn end_render_pass(&mut self) {
        self.emit(Record::EndRenderPass);
    }

    fn draw_context(&mut self) -> &mut dyn DrawContext {
        self
    }
}

impl DrawContext for CaptureRecorder {
    fn bind_graphics_pipeline(&mut self, pipeline: Handle) {
        let pipeline = self.id(pipeline);
        self.emit(Record::BindGraphicsPipeline { pipeline });
    }

    fn bind_descriptor_set(&mut self, index: u32, set: Handle, dynamic_offsets: &[u32]) {
        self.bind_set(index, set, dynamic_offsets);
    }

    fn push_constant(&mut self, offset: u32, stages: ShaderStages, data: &[u8]) {
        self.push_bytes(offset, stages, data);
    }

    fn set_viewport(&mut self, first: u32, viewports: &[Viewport]) {
        self.emit(Record::SetViewport { first, viewports: viewports.to_vec() });
    }

    fn set_scissor(&mut self, first: u32, scissors: &[Rect2]) {
        self.emit(Record::SetScissor { first, scissors: scissors.to_vec() });
    }

    fn set_stencil_reference(&mut self, value: u32) {
        self.emit(Record::SetStencilReference { value });
    }

    fn set_blend_constants(&mut self, color: [f32; 4]) {
        self.emit(Record::SetBlendConstants { color });
    }

    fn bind_index_buffer(&mut self, buffer: Handle, offset: u64, index_type: IndexType) {
        let buffer = self.id(buffer);
        self.emit(Record::BindIndexBuffer { buffer, offset, index_type });
    }

    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[Handle], offsets: &[u64]) {
        if buffers.len() != offsets.len() {
            self.latch(GfxError::validation(format!(
                "{} vertex buffers with {} offsets",
                buffers.len(),
                offsets.len()
            )));
            return;
        }
        let buffers = self.ids(buffers);
        self.emit(Record::BindVertexBuffers { first_binding, buffers, offsets: offsets.to_vec() });
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.emit(Record::Draw { vertex_count, instance_count, first_vertex, first_instance });
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.emit(Record::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    fn draw_indirect(&mut self, buffer: Handle, offset: u64, draw_count: u32, stride: u32) {
        let buffer = self.id(buffer);
        self.emit(Record::DrawIndirect { buffer, offset, draw_count, stride });
    }

    fn draw_indexed_indirect(&mut self, buffer: Handle, offset: u64, draw_count: u32, stride: u32) {
        let buffer = self.id(buffer);
        self.emit(Record::DrawIndexedIndirect { buffer, offset, draw_count, stride });
    }

    fn draw_mesh_tasks(&mut self, group_count: [u32; 3]) {
        self.emit(Record::DrawMeshTasks { group_count });
    }
}

impl AsBuildContext for CaptureRecorder {
    fn build_geometry(&mut self, build: &GeometryBuild) {
        let record = Record::BuildGeometry {
            dst: self.id(build.dst),
            scratch: self.id(build.scratch),
            scratch_offset: build.scratch_offset,
            geometry: self.id(build.geometry),
            geometry_offset: build.geometry_offset,
            primitive_count: build.primitive_count,
        };
        self.emit(record);
    }

    fn build_scene(&mut self, build: &SceneBuild) {
        let record = Record::BuildScene {
            dst: self.id(build.dst),
            scratch: self.id(build.scratch),
            scratch_offset: build.scratch_offset,
            instances: self.id(build.instances),
            instances_offset: build.instances_offset,
            instance_count: build.instance_count,
        };
        self.emit(record);
    }

    fn copy_acceleration_structure(&mut self, src: Handle, dst: Handle, compact: bool) {
        let (src, dst) = (self.id(src), self.id(dst));
        self.emit(Record::CopyAccelerationStructure { src, dst, compact });
    }

    fn write_compacted_size(&mut self, src: Handle, query_pool: Handle, index: u32) {
        let (src, query_pool) = (self.id(src), self.id(query_pool));
        self.emit(Record::WriteCompactedSize { src, query_pool, index });
    }
}

impl RayTracingContext for CaptureRecorder {
    fn bind_ray_tracing_pipeline(&mut self, pipeline: Handle) {
        let pipeline = self.id(pipeline);
        self.emit(Record::BindRayTracingPipeline { pipeline });
    }

    fn bind_descriptor_set(&mut self, index: u32, set: Handle, dynamic_offsets: &[u32]) {
        self.bind_set(index, set, dynamic_offsets);
    }

    fn push_constant(&mut self, offset: u32, stages: ShaderStages, data: &[u8]) {
        self.push_bytes(offset, stages, data);
    }

    fn set_stack_size(&mut self, bytes: u32) {
        self.emit(Record::SetStackSize { bytes });
    }

    fn trace_rays(&mut self, sbt: Handle, dim: [u32; 3]) {
        let sbt = self.id(sbt);
        self.emit(Record::TraceRays { sbt, dim });
    }

    fn trace_rays_indirect(&mut self, sbt: Handle, buffer: Handle, offset: u64) {
        let (sbt, buffer) = (self.id(sbt), self.id(buffer));
        self.emit(Record::TraceRaysIndirect { sbt, buffer, offset });
    }
}
