//! Baked stream replay.
//!
//! A `CmdBufBake` blob is `records | payload`. Host→device payload slices are
//! copied into upload staging first and device→host slots get readback
//! staging, then records are decoded one at a time and dispatched to the
//! context of the active kind. Replay is all-or-nothing: any failure
//! discards the native command buffer.

use std::sync::Arc;

use rkyv::util::AlignedVec;
use tracing::{debug, trace};

use rgfx_core::context::{
    AsBuildContext, Attachment, CommandContext, ComputeContext, ContextFactory, DrawContext,
    GeometryBuild, GraphicsContext, KindTracker, KindTransition, RayTracingContext, RenderPassDesc,
    SceneBuild, TransferContext,
};
use rgfx_core::staging::StagingRequest;
use rgfx_core::{
    BarrierManager, BarrierRecorder, GfxError, Handle, HandleValidator, StagingBufferManager,
    StagingRange,
};
use rgfx_protocol::messages::CmdBufBake;
use rgfx_protocol::types::{PipelineStages, ShaderStages};
use rgfx_protocol::{ContextKind, FrameId, QueueType, Record, RecordStream, RemoteId, CATALOG_VERSION};

/// Run `$body` with `$ctx` bound to whichever context is open.
macro_rules! common {
    ($active:expr, $ctx:ident => $body:expr) => {
        match $active {
            Active::Transfer($ctx) => $body,
            Active::Compute($ctx) => $body,
            Active::Graphics($ctx) => $body,
            Active::AsBuild($ctx) => $body,
            Active::RayTracing($ctx) => $body,
            Active::None => return Err(GfxError::validation("record outside any segment")),
        }
    };
}

/// Readback staging filled by a baked command buffer. The bytes are valid
/// once `frame` retires.
#[derive(Debug, Clone)]
pub struct PendingReadback {
    pub token: u64,
    pub frame: FrameId,
    pub ranges: Vec<StagingRange>,
}

impl PendingReadback {
    pub fn size(&self) -> u64 {
        self.ranges.iter().map(|r| r.size).sum()
    }

    /// Gather the ranges into one contiguous buffer.
    pub fn collect(&self) -> Result<Vec<u8>, GfxError> {
        let mut out = Vec::with_capacity(self.size() as usize);
        for range in &self.ranges {
            out.extend_from_slice(&range.read(0, range.size as usize)?);
        }
        Ok(out)
    }
}

pub struct BakeRequest<'a> {
    pub bake: &'a CmdBufBake,
    pub blob: &'a [u8],
    pub queue: QueueType,
    pub frame: FrameId,
    pub label: &'a str,
}

#[derive(Debug)]
pub struct Baked {
    pub cmdbuf: Handle,
    pub records: u32,
    pub readbacks: Vec<PendingReadback>,
}

/// Staging prepared for one bake, indexed like the message's copy tables.
struct Staged {
    uploads: Vec<Vec<StagingRange>>,
    readbacks: Vec<Vec<StagingRange>>,
}

pub struct ReplayExecutor {
    contexts: Arc<dyn ContextFactory>,
    validator: Arc<dyn HandleValidator>,
    staging: Arc<StagingBufferManager>,
}

impl ReplayExecutor {
    pub fn new(
        contexts: Arc<dyn ContextFactory>,
        validator: Arc<dyn HandleValidator>,
        staging: Arc<StagingBufferManager>,
    ) -> Self {
        Self { contexts, validator, staging }
    }

    /// Rebuild one native command buffer from a baked stream.
    pub fn bake(&self, req: &BakeRequest<'_>) -> Result<Baked, GfxError> {
        let bake = req.bake;
        if bake.catalog_version != CATALOG_VERSION {
            return Err(GfxError::Protocol(format!(
                "stream baked against record catalog v{}, host speaks v{}",
                bake.catalog_version, CATALOG_VERSION
            )));
        }
        let records_size = usize::try_from(bake.records_size)
            .ok()
            .filter(|size| *size <= req.blob.len())
            .ok_or_else(|| {
                GfxError::validation(format!(
                    "records_size {} exceeds blob of {} bytes",
                    bake.records_size,
                    req.blob.len()
                ))
            })?;
        let (records, payload) = req.blob.split_at(records_size);

        let staged = self.stage(req, payload)?;
        let cmdbuf = self.contexts.begin_command_buffer(req.queue, req.label)?;
        let replayed = self
            .replay(cmdbuf, records, &staged)
            .and_then(|count| {
                if count == bake.record_count {
                    Ok(count)
                } else {
                    Err(GfxError::validation(format!(
                        "stream holds {} records, bake declares {}",
                        count, bake.record_count
                    )))
                }
            })
            .and_then(|count| self.contexts.end_command_buffer(cmdbuf).map(|()| count));

        match replayed {
            Ok(records) => {
                let readbacks = bake
                    .dev_to_host
                    .iter()
                    .zip(staged.readbacks)
                    .map(|(copy, ranges)| PendingReadback { token: copy.token, frame: req.frame, ranges })
                    .collect();
                debug!(%cmdbuf, records, label = req.label, "stream baked");
                Ok(Baked { cmdbuf, records, readbacks })
            }
            Err(e) => {
                self.contexts.discard_command_buffer(cmdbuf);
                Err(e)
            }
        }
    }

    fn stage(&self, req: &BakeRequest<'_>, payload: &[u8]) -> Result<Staged, GfxError> {
        let block_size = u64::from(req.bake.block_size)
            .clamp(1, self.staging.config().dynamic_block_size);

        let mut uploads = Vec::with_capacity(req.bake.host_to_dev.len());
        for (index, copy) in req.bake.host_to_dev.iter().enumerate() {
            let bytes = usize::try_from(copy.stream_offset)
                .ok()
                .zip(usize::try_from(copy.size).ok())
                .and_then(|(start, len)| payload.get(start..start.checked_add(len)?))
                .ok_or_else(|| {
                    GfxError::validation(format!(
                        "upload {} ({}..+{}) outside payload of {} bytes",
                        index,
                        copy.stream_offset,
                        copy.size,
                        payload.len()
                    ))
                })?;
            let request = StagingRequest::upload(copy.size, req.frame)
                .block_size(block_size)
                .queue(req.queue);
            let ranges = self.staging.get_buffer_ranges(&request)?;
            let mut at = 0usize;
            for range in &ranges {
                let len = range.size as usize;
                range.write(0, &bytes[at..at + len])?;
                at += len;
            }
            uploads.push(ranges);
        }

        let mut readbacks = Vec::with_capacity(req.bake.dev_to_host.len());
        for copy in &req.bake.dev_to_host {
            let request = StagingRequest::readback(copy.size, req.frame)
                .block_size(block_size)
                .queue(req.queue);
            readbacks.push(self.staging.get_buffer_ranges(&request)?);
        }

        trace!(uploads = uploads.len(), readbacks = readbacks.len(), "bake staging prepared");
        Ok(Staged { uploads, readbacks })
    }

    fn replay(&self, cmdbuf: Handle, records: &[u8], staged: &Staged) -> Result<u32, GfxError> {
        let mut scratch = AlignedVec::<16>::new();
        let mut tracker = KindTracker::new();
        let mut barriers = BarrierManager::with_validator(self.validator.clone());
        let mut active = Active::None;
        let mut count = 0u32;

        for bytes in RecordStream::new(records) {
            let bytes = bytes.map_err(|e| GfxError::Protocol(e.to_string()))?;
            let record = Record::decode(bytes, &mut scratch)
                .map_err(|e| GfxError::Protocol(format!("record {}: {}", count, e)))?;
            count += 1;

            if let KindTransition::Begin { started, .. } = tracker.apply(&record)? {
                active.close(&barriers)?;
                active = self.open(cmdbuf, started)?;
                continue;
            }
            self.execute(&mut active, &mut barriers, &record, staged)?;
        }

        tracker.finish()?;
        active.close(&barriers)?;
        Ok(count)
    }

    fn open<'a>(&'a self, cmdbuf: Handle, kind: ContextKind) -> Result<Active<'a>, GfxError> {
        Ok(match kind {
            ContextKind::Transfer => Active::Transfer(self.contexts.transfer(cmdbuf)?),
            ContextKind::Compute => Active::Compute(self.contexts.compute(cmdbuf)?),
            ContextKind::Graphics => Active::Graphics(self.contexts.graphics(cmdbuf)?),
            ContextKind::AsBuild => Active::AsBuild(self.contexts.as_build(cmdbuf)?),
            ContextKind::RayTracing => Active::RayTracing(self.contexts.ray_tracing(cmdbuf)?),
            ContextKind::Unknown | ContextKind::RenderPass => {
                return Err(GfxError::validation(format!("{:?} cannot start a segment", kind)))
            }
        })
    }

    fn resolve(&self, id: RemoteId) -> Result<Handle, GfxError> {
        let handle = Handle::from(id);
        if handle.is_valid() && self.validator.is_alive(handle) {
            Ok(handle)
        } else {
            Err(GfxError::StaleHandle(handle))
        }
    }

    fn resolve_all(&self, ids: &[RemoteId]) -> Result<Vec<Handle>, GfxError> {
        ids.iter().map(|id| self.resolve(*id)).collect()
    }

    fn execute(
        &self,
        active: &mut Active<'_>,
        barriers: &mut BarrierManager,
        record: &Record,
        staged: &Staged,
    ) -> Result<(), GfxError> {
        match record {
            // ── Any kind ────────────────────────────────────────────────
            Record::DebugMarker { label, color } => common!(active, ctx => ctx.debug_marker(label, *color)),
            Record::PushDebugGroup { label, color } => {
                common!(active, ctx => ctx.push_debug_group(label, *color))
            }
            Record::PopDebugGroup => common!(active, ctx => ctx.pop_debug_group()),
            Record::WriteTimestamp { query_pool, index, stage } => {
                let pool = self.resolve(*query_pool)?;
                let stage = PipelineStages::from_bits_truncate(*stage);
                common!(active, ctx => ctx.write_timestamp(pool, *index, stage))
            }

            // ── Barriers ────────────────────────────────────────────────
            Record::BufferBarrier { buffer, src, dst } => {
                barriers.buffer_barrier(self.resolve(*buffer)?, *src, *dst)
            }
            Record::BufferRangeBarrier { buffer, offset, size, src, dst } => {
                barriers.buffer_range_barrier(self.resolve(*buffer)?, *offset, *size, *src, *dst)
            }
            Record::ImageBarrier { image, range, src, dst } => {
                let image = self.resolve(*image)?;
                match range {
                    Some(range) => barriers.image_range_barrier(image, *range, *src, *dst),
                    None => barriers.image_barrier(image, *src, *dst),
                }
            }
            Record::MemoryBarrier { src, dst } => barriers.memory_barrier(*src, *dst),
            Record::ExecutionBarrier { src_stages, dst_stages } => barriers.execution_barrier(
                PipelineStages::from_bits_truncate(*src_stages),
                PipelineStages::from_bits_truncate(*dst_stages),
            ),
            Record::AcquireBufferOwnership { buffer, src_queue, src, dst } => {
                barriers.acquire_buffer_ownership(self.resolve(*buffer)?, *src_queue, *src, *dst)
            }
            Record::ReleaseBufferOwnership { buffer, dst_queue, src, dst } => {
                barriers.release_buffer_ownership(self.resolve(*buffer)?, *dst_queue, *src, *dst)
            }
            Record::AcquireImageOwnership { image, src_queue, src, dst } => {
                barriers.acquire_image_ownership(self.resolve(*image)?, *src_queue, *src, *dst)
            }
            Record::ReleaseImageOwnership { image, dst_queue, src, dst } => {
                barriers.release_image_ownership(self.resolve(*image)?, *dst_queue, *src, *dst)
            }
            Record::CommitBarriers => common!(active, ctx => barriers.commit_barriers(&mut **ctx)?),

            // ── Transfer ────────────────────────────────────────────────
            Record::ClearColorImage { image, color, ranges } => {
                let image = self.resolve(*image)?;
                active.transfer()?.clear_color_image(image, *color, ranges);
            }
            Record::ClearDepthStencilImage { image, depth, stencil, ranges } => {
                let image = self.resolve(*image)?;
                active.transfer()?.clear_depth_stencil_image(image, *depth, *stencil, ranges);
            }
            Record::FillBuffer { buffer, offset, size, data } => {
                let buffer = self.resolve(*buffer)?;
                active.transfer()?.fill_buffer(buffer, *offset, *size, *data);
            }
            Record::UpdateBuffer { buffer, offset, data } => {
                let buffer = self.resolve(*buffer)?;
                active.transfer()?.update_buffer(buffer, *offset, data);
            }
            Record::CopyBuffer { src, dst, regions } => {
                let (src, dst) = (self.resolve(*src)?, self.resolve(*dst)?);
                active.transfer()?.copy_buffer(src, dst, regions);
            }
            Record::CopyImage { src, dst, regions } => {
                let (src, dst) = (self.resolve(*src)?, self.resolve(*dst)?);
                active.transfer()?.copy_image(src, dst, regions);
            }
            Record::CopyBufferToImage { src, dst, regions } => {
                let (src, dst) = (self.resolve(*src)?, self.resolve(*dst)?);
                active.transfer()?.copy_buffer_to_image(src, dst, regions);
            }
            Record::CopyImageToBuffer { src, dst, regions } => {
                let (src, dst) = (self.resolve(*src)?, self.resolve(*dst)?);
                active.transfer()?.copy_image_to_buffer(src, dst, regions);
            }
            Record::GenerateMipmaps { image } => {
                let image = self.resolve(*image)?;
                active.transfer()?.generate_mipmaps(image);
            }
            Record::UploadBuffer { payload, buffer, offset } => {
                let ranges = staged.uploads.get(*payload as usize).ok_or_else(|| {
                    GfxError::validation(format!("upload {} not in the copy table", payload))
                })?;
                let buffer = self.resolve(*buffer)?;
                let ctx = active.transfer()?;
                let mut at = *offset;
                for range in ranges {
                    ctx.copy_from_staging(range, buffer, at);
                    at += range.size;
                }
            }
            Record::ReadbackBuffer { readback, buffer, offset } => {
                let ranges = staged.readbacks.get(*readback as usize).ok_or_else(|| {
                    GfxError::validation(format!("readback {} not in the copy table", readback))
                })?;
                let buffer = self.resolve(*buffer)?;
                let ctx = active.transfer()?;
                let mut at = *offset;
                for range in ranges {
                    ctx.copy_to_staging(buffer, at, range);
                    at += range.size;
                }
            }

            // ── Pipeline state shared by compute, draw and ray tracing ──
            Record::BindDescriptorSet { index, set, dynamic_offsets } => {
                let set = self.resolve(*set)?;
                match active {
                    Active::Compute(ctx) => ctx.bind_descriptor_set(*index, set, dynamic_offsets),
                    Active::Graphics(ctx) => {
                        ctx.draw_context().bind_descriptor_set(*index, set, dynamic_offsets)
                    }
                    Active::RayTracing(ctx) => ctx.bind_descriptor_set(*index, set, dynamic_offsets),
                    _ => return Err(active.mismatch(record)),
                }
            }
            Record::PushConstant { offset, stages, data } => {
                let stages = ShaderStages::from_bits_truncate(*stages);
                match active {
                    Active::Compute(ctx) => ctx.push_constant(*offset, stages, data),
                    Active::Graphics(ctx) => ctx.draw_context().push_constant(*offset, stages, data),
                    Active::RayTracing(ctx) => ctx.push_constant(*offset, stages, data),
                    _ => return Err(active.mismatch(record)),
                }
            }

            // ── Compute ─────────────────────────────────────────────────
            Record::BindComputePipeline { pipeline } => {
                let pipeline = self.resolve(*pipeline)?;
                active.compute()?.bind_compute_pipeline(pipeline);
            }
            Record::Dispatch { group_count } => active.compute()?.dispatch(*group_count),
            Record::DispatchIndirect { buffer, offset } => {
                let buffer = self.resolve(*buffer)?;
                active.compute()?.dispatch_indirect(buffer, *offset);
            }

            // ── Graphics ────────────────────────────────────────────────
            Record::BeginRenderPass { attachments, area, layer_count } => {
                let attachments = attachments
                    .iter()
                    .map(|a| {
                        Ok(Attachment {
                            image: self.resolve(a.image)?,
                            clear: a.clear,
                            initial: a.initial,
                            final_state: a.final_state,
                        })
                    })
                    .collect::<Result<Vec<_>, GfxError>>()?;
                let desc = RenderPassDesc { attachments, area: *area, layer_count: *layer_count };
                active.graphics()?.begin_render_pass(&desc);
            }
            Record::NextSubpass => active.graphics()?.next_subpass(),
            Record::EndRenderPass => active.graphics()?.end_render_pass(),

            Record::BindGraphicsPipeline { pipeline } => {
                let pipeline = self.resolve(*pipeline)?;
                active.graphics()?.draw_context().bind_graphics_pipeline(pipeline);
            }
            Record::SetViewport { first, viewports } => {
                active.graphics()?.draw_context().set_viewport(*first, viewports)
            }
            Record::SetScissor { first, scissors } => {
                active.graphics()?.draw_context().set_scissor(*first, scissors)
            }
            Record::SetStencilReference { value } => {
                active.graphics()?.draw_context().set_stencil_reference(*value)
            }
            Record::SetBlendConstants { color } => {
                active.graphics()?.draw_context().set_blend_constants(*color)
            }
            Record::BindIndexBuffer { buffer, offset, index_type } => {
                let buffer = self.resolve(*buffer)?;
                active.graphics()?.draw_context().bind_index_buffer(buffer, *offset, *index_type);
            }
            Record::BindVertexBuffers { first_binding, buffers, offsets } => {
                let buffers = self.resolve_all(buffers)?;
                active.graphics()?.draw_context().bind_vertex_buffers(*first_binding, &buffers, offsets);
            }
            Record::Draw { vertex_count, instance_count, first_vertex, first_instance } => active
                .graphics()?
                .draw_context()
                .draw(*vertex_count, *instance_count, *first_vertex, *first_instance),
            Record::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => active.graphics()?.draw_context().draw_indexed(
                *index_count,
                *instance_count,
                *first_index,
                *vertex_offset,
                *first_instance,
            ),
            Record::DrawIndirect { buffer, offset, draw_count, stride } => {
                let buffer = self.resolve(*buffer)?;
                active.graphics()?.draw_context().draw_indirect(buffer, *offset, *draw_count, *stride);
            }
            Record::DrawIndexedIndirect { buffer, offset, draw_count, stride } => {
                let buffer = self.resolve(*buffer)?;
                active
                    .graphics()?
                    .draw_context()
                    .draw_indexed_indirect(buffer, *offset, *draw_count, *stride);
            }
            Record::DrawMeshTasks { group_count } => {
                active.graphics()?.draw_context().draw_mesh_tasks(*group_count)
            }

            // ── Acceleration structures ─────────────────────────────────
            Record::BuildGeometry {
                dst,
                scratch,
                scratch_offset,
                geometry,
                geometry_offset,
                primitive_count,
            } => {
                let build = GeometryBuild {
                    dst: self.resolve(*dst)?,
                    scratch: self.resolve(*scratch)?,
                    scratch_offset: *scratch_offset,
                    geometry: self.resolve(*geometry)?,
                    geometry_offset: *geometry_offset,
                    primitive_count: *primitive_count,
                };
                active.as_build()?.build_geometry(&build);
            }
            Record::BuildScene {
                dst,
                scratch,
                scratch_offset,
                instances,
                instances_offset,
                instance_count,
            } => {
                let build = SceneBuild {
                    dst: self.resolve(*dst)?,
                    scratch: self.resolve(*scratch)?,
                    scratch_offset: *scratch_offset,
                    instances: self.resolve(*instances)?,
                    instances_offset: *instances_offset,
                    instance_count: *instance_count,
                };
                active.as_build()?.build_scene(&build);
            }
            Record::CopyAccelerationStructure { src, dst, compact } => {
                let (src, dst) = (self.resolve(*src)?, self.resolve(*dst)?);
                active.as_build()?.copy_acceleration_structure(src, dst, *compact);
            }
            Record::WriteCompactedSize { src, query_pool, index } => {
                let (src, pool) = (self.resolve(*src)?, self.resolve(*query_pool)?);
                active.as_build()?.write_compacted_size(src, pool, *index);
            }

            // ── Ray tracing ─────────────────────────────────────────────
            Record::BindRayTracingPipeline { pipeline } => {
                let pipeline = self.resolve(*pipeline)?;
                active.ray_tracing()?.bind_ray_tracing_pipeline(pipeline);
            }
            Record::SetStackSize { bytes } => active.ray_tracing()?.set_stack_size(*bytes),
            Record::TraceRays { sbt, dim } => {
                let sbt = self.resolve(*sbt)?;
                active.ray_tracing()?.trace_rays(sbt, *dim);
            }
            Record::TraceRaysIndirect { sbt, buffer, offset } => {
                let (sbt, buffer) = (self.resolve(*sbt)?, self.resolve(*buffer)?);
                active.ray_tracing()?.trace_rays_indirect(sbt, buffer, *offset);
            }

            Record::BeginTransfer { .. }
            | Record::BeginCompute { .. }
            | Record::BeginGraphics { .. }
            | Record::BeginAsBuild { .. }
            | Record::BeginRayTracing { .. } => {
                return Err(GfxError::validation("segment begin reached the executor"))
            }
        }
        Ok(())
    }
}

// ── Active segment ──────────────────────────────────────────────────────


enum Active<'a> {
    None,
    Transfer(Box<dyn TransferContext + 'a>),
    Compute(Box<dyn ComputeContext + 'a>),
    Graphics(Box<dyn GraphicsContext + 'a>),
    AsBuild(Box<dyn AsBuildContext + 'a>),
    RayTracing(Box<dyn RayTracingContext + 'a>),
}

impl<'a> Active<'a> {
    fn kind(&self) -> ContextKind {
        match self {
            Active::None => ContextKind::Unknown,
            Active::Transfer(_) => ContextKind::Transfer,
            Active::Compute(_) => ContextKind::Compute,
            Active::Graphics(_) => ContextKind::Graphics,
            Active::AsBuild(_) => ContextKind::AsBuild,
            Active::RayTracing(_) => ContextKind::RayTracing,
        }
    }

    fn mismatch(&self, record: &Record) -> GfxError {
        GfxError::KindMismatch { record: record.name(), active: self.kind() }
    }

    fn wrong(&self, wanted: ContextKind) -> GfxError {
        GfxError::validation(format!("{:?} record with a {:?} context open", wanted, self.kind()))
    }

    fn transfer(&mut self) -> Result<&mut (dyn TransferContext + 'a), GfxError> {
        match self {
            Active::Transfer(ctx) => Ok(ctx.as_mut()),
            other => Err(other.wrong(ContextKind::Transfer)),
        }
    }

    fn compute(&mut self) -> Result<&mut (dyn ComputeContext + 'a), GfxError> {
        match self {
            Active::Compute(ctx) => Ok(ctx.as_mut()),
            other => Err(other.wrong(ContextKind::Compute)),
        }
    }

    fn graphics(&mut self) -> Result<&mut (dyn GraphicsContext + 'a), GfxError> {
        match self {
            Active::Graphics(ctx) => Ok(ctx.as_mut()),
            other => Err(other.wrong(ContextKind::Graphics)),
        }
    }

    fn as_build(&mut self) -> Result<&mut (dyn AsBuildContext + 'a), GfxError> {
        match self {
            Active::AsBuild(ctx) => Ok(ctx.as_mut()),
            other => Err(other.wrong(ContextKind::AsBuild)),
        }
    }

    fn ray_tracing(&mut self) -> Result<&mut (dyn RayTracingContext + 'a), GfxError> {
        match self {
            Active::RayTracing(ctx) => Ok(ctx.as_mut()),
            other => Err(other.wrong(ContextKind::RayTracing)),
        }
    }

    /// End the open segment. Barriers must all have been committed.
    fn close(&mut self, barriers: &BarrierManager) -> Result<(), GfxError> {
        if !barriers.no_pending_barriers() {
            return Err(GfxError::validation(format!(
                "{:?} segment ends with {} uncommitted barrier(s)",
                self.kind(),
                barriers.pending().len()
            )));
        }
        let result = match self {
            Active::None => Ok(()),
            Active::Transfer(ctx) => ctx.finish(),
            Active::Compute(ctx) => ctx.finish(),
            Active::Graphics(ctx) => ctx.finish(),
            Active::AsBuild(ctx) => ctx.finish(),
            Active::RayTracing(ctx) => ctx.finish(),
        };
        *self = Active::None;
        result
    }
}
