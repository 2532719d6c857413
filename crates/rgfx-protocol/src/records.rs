use serde::{Deserialize, Serialize};

use crate::handle::RemoteId;
use crate::types::{
    BufferCopy, BufferImageCopy, ClearValue, ImageCopy, ImageSubresourceRange, IndexType,
    QueueType, Rect2, ResourceState, Viewport,
};

/// Version of the replayable record catalog. Bump whenever a variant is
/// added, removed or reordered; the host refuses streams baked against a
/// different catalog.
pub const CATALOG_VERSION: u16 = 1;

/// Which context flavor is active while a command stream is replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ContextKind {
    Unknown,
    Transfer,
    Compute,
    Graphics,
    RenderPass,
    AsBuild,
    RayTracing,
}

bitflags::bitflags! {
    /// Set of context kinds a record may run in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KindMask: u8 {
        const TRANSFER      = 1 << 0;
        const COMPUTE       = 1 << 1;
        const GRAPHICS      = 1 << 2;
        const RENDER_PASS   = 1 << 3;
        const AS_BUILD      = 1 << 4;
        const RAY_TRACING   = 1 << 5;

        /// Every kind that owns a command buffer segment directly.
        const PRIMARY = Self::TRANSFER.bits() | Self::COMPUTE.bits() | Self::GRAPHICS.bits()
                      | Self::AS_BUILD.bits() | Self::RAY_TRACING.bits();
        const ANY = Self::PRIMARY.bits() | Self::RENDER_PASS.bits();
        const PIPELINE = Self::COMPUTE.bits() | Self::RENDER_PASS.bits() | Self::RAY_TRACING.bits();
    }
}

impl ContextKind {
    pub fn mask(self) -> KindMask {
        match self {
            ContextKind::Unknown => KindMask::empty(),
            ContextKind::Transfer => KindMask::TRANSFER,
            ContextKind::Compute => KindMask::COMPUTE,
            ContextKind::Graphics => KindMask::GRAPHICS,
            ContextKind::RenderPass => KindMask::RENDER_PASS,
            ContextKind::AsBuild => KindMask::AS_BUILD,
            ContextKind::RayTracing => KindMask::RAY_TRACING,
        }
    }
}

/// Render target bound at render-pass begin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct AttachmentRecord {
    pub image: RemoteId,
    pub clear: Option<ClearValue>,
    pub initial: ResourceState,
    pub final_state: ResourceState,
}

/// One captured context call. Records hold only remote ids and plain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Record {
    // ── Context segments ───────────────────────────────────────
    BeginTransfer { label: String },
    BeginCompute { label: String },
    BeginGraphics { label: String },
    BeginAsBuild { label: String },
    BeginRayTracing { label: String },

    // ── Debug and queries (any kind) ───────────────────────────
    DebugMarker { label: String, color: u32 },
    PushDebugGroup { label: String, color: u32 },
    PopDebugGroup,
    WriteTimestamp { query_pool: RemoteId, index: u32, stage: u32 },

    // ── Barriers ───────────────────────────────────────────────
    BufferBarrier { buffer: RemoteId, src: ResourceState, dst: ResourceState },
    BufferRangeBarrier {
        buffer: RemoteId,
        offset: u64,
        size: u64,
        src: ResourceState,
        dst: ResourceState,
    },
    ImageBarrier {
        image: RemoteId,
        range: Option<ImageSubresourceRange>,
        src: ResourceState,
        dst: ResourceState,
    },
    MemoryBarrier { src: ResourceState, dst: ResourceState },
    ExecutionBarrier { src_stages: u32, dst_stages: u32 },
    AcquireBufferOwnership {
        buffer: RemoteId,
        src_queue: QueueType,
        src: ResourceState,
        dst: ResourceState,
    },
    ReleaseBufferOwnership {
        buffer: RemoteId,
        dst_queue: QueueType,
        src: ResourceState,
        dst: ResourceState,
    },
    AcquireImageOwnership {
        image: RemoteId,
        src_queue: QueueType,
        src: ResourceState,
        dst: ResourceState,
    },
    ReleaseImageOwnership {
        image: RemoteId,
        dst_queue: QueueType,
        src: ResourceState,
        dst: ResourceState,
    },
    CommitBarriers,

    // ── Transfer ───────────────────────────────────────────────
    ClearColorImage { image: RemoteId, color: [f32; 4], ranges: Vec<ImageSubresourceRange> },
    ClearDepthStencilImage {
        image: RemoteId,
        depth: f32,
        stencil: u32,
        ranges: Vec<ImageSubresourceRange>,
    },
    FillBuffer { buffer: RemoteId, offset: u64, size: u64, data: u32 },
    UpdateBuffer { buffer: RemoteId, offset: u64, data: Vec<u8> },
    CopyBuffer { src: RemoteId, dst: RemoteId, regions: Vec<BufferCopy> },
    CopyImage { src: RemoteId, dst: RemoteId, regions: Vec<ImageCopy> },
    CopyBufferToImage { src: RemoteId, dst: RemoteId, regions: Vec<BufferImageCopy> },
    CopyImageToBuffer { src: RemoteId, dst: RemoteId, regions: Vec<BufferImageCopy> },
    GenerateMipmaps { image: RemoteId },
    /// Copy host payload `payload` (index into the host→device table) into `buffer`.
    UploadBuffer { payload: u32, buffer: RemoteId, offset: u64 },
    /// Copy from `buffer` into readback slot `readback` (index into the device→host table).
    ReadbackBuffer { readback: u32, buffer: RemoteId, offset: u64 },

    // ── Compute ────────────────────────────────────────────────
    BindComputePipeline { pipeline: RemoteId },
    BindDescriptorSet { index: u32, set: RemoteId, dynamic_offsets: Vec<u32> },
    PushConstant { offset: u32, stages: u32, data: Vec<u8> },
    Dispatch { group_count: [u32; 3] },
    DispatchIndirect { buffer: RemoteId, offset: u64 },

    // ── Graphics ───────────────────────────────────────────────
    BeginRenderPass { attachments: Vec<AttachmentRecord>, area: Rect2, layer_count: u32 },
    NextSubpass,
    EndRenderPass,

    // ── Render pass (draw) ─────────────────────────────────────
    BindGraphicsPipeline { pipeline: RemoteId },
    SetViewport { first: u32, viewports: Vec<Viewport> },
    SetScissor { first: u32, scissors: Vec<Rect2> },
    SetStencilReference { value: u32 },
    SetBlendConstants { color: [f32; 4] },
    BindIndexBuffer { buffer: RemoteId, offset: u64, index_type: IndexType },
    BindVertexBuffers { first_binding: u32, buffers: Vec<RemoteId>, offsets: Vec<u64> },
    Draw { vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32 },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect { buffer: RemoteId, offset: u64, draw_count: u32, stride: u32 },
    DrawIndexedIndirect { buffer: RemoteId, offset: u64, draw_count: u32, stride: u32 },
    DrawMeshTasks { group_count: [u32; 3] },

    // ── Acceleration structure build ───────────────────────────
    BuildGeometry {
        dst: RemoteId,
        scratch: RemoteId,
        scratch_offset: u64,
        geometry: RemoteId,
        geometry_offset: u64,
        primitive_count: u32,
    },
    BuildScene {
        dst: RemoteId,
        scratch: RemoteId,
        scratch_offset: u64,
        instances: RemoteId,
        instances_offset: u64,
        instance_count: u32,
    },
    CopyAccelerationStructure { src: RemoteId, dst: RemoteId, compact: bool },
    WriteCompactedSize { src: RemoteId, query_pool: RemoteId, index: u32 },

    // ── Ray tracing ────────────────────────────────────────────
    BindRayTracingPipeline { pipeline: RemoteId },
    SetStackSize { bytes: u32 },
    TraceRays { sbt: RemoteId, dim: [u32; 3] },
    TraceRaysIndirect { sbt: RemoteId, buffer: RemoteId, offset: u64 },
}

impl Record {
    pub fn name(&self) -> &'static str {
        match self {
            Record::BeginTransfer { .. } => "BeginTransfer",
            Record::BeginCompute { .. } => "BeginCompute",
            Record::BeginGraphics { .. } => "BeginGraphics",
            Record::BeginAsBuild { .. } => "BeginAsBuild",
            Record::BeginRayTracing { .. } => "BeginRayTracing",
            Record::DebugMarker { .. } => "DebugMarker",
            Record::PushDebugGroup { .. } => "PushDebugGroup",
            Record::PopDebugGroup => "PopDebugGroup",
            Record::WriteTimestamp { .. } => "WriteTimestamp",
            Record::BufferBarrier { .. } => "BufferBarrier",
            Record::BufferRangeBarrier { .. } => "BufferRangeBarrier",
            Record::ImageBarrier { .. } => "ImageBarrier",
            Record::MemoryBarrier { .. } => "MemoryBarrier",
            Record::ExecutionBarrier { .. } => "ExecutionBarrier",
            Record::AcquireBufferOwnership { .. } => "AcquireBufferOwnership",
            Record::ReleaseBufferOwnership { .. } => "ReleaseBufferOwnership",
            Record::AcquireImageOwnership { .. } => "AcquireImageOwnership",
            Record::ReleaseImageOwnership { .. } => "ReleaseImageOwnership",
            Record::CommitBarriers => "CommitBarriers",
            Record::ClearColorImage { .. } => "ClearColorImage",
            Record::ClearDepthStencilImage { .. } => "ClearDepthStencilImage",
            Record::FillBuffer { .. } => "FillBuffer",
            Record::UpdateBuffer { .. } => "UpdateBuffer",
            Record::CopyBuffer { .. } => "CopyBuffer",
            Record::CopyImage { .. } => "CopyImage",
            Record::CopyBufferToImage { .. } => "CopyBufferToImage",
            Record::CopyImageToBuffer { .. } => "CopyImageToBuffer",
            Record::GenerateMipmaps { .. } => "GenerateMipmaps",
            Record::UploadBuffer { .. } => "UploadBuffer",
            Record::ReadbackBuffer { .. } => "ReadbackBuffer",
            Record::BindComputePipeline { .. } => "BindComputePipeline",
            Record::BindDescriptorSet { .. } => "BindDescriptorSet",
            Record::PushConstant { .. } => "PushConstant",
            Record::Dispatch { .. } => "Dispatch",
            Record::DispatchIndirect { .. } => "DispatchIndirect",
            Record::BeginRenderPass { .. } => "BeginRenderPass",
            Record::NextSubpass => "NextSubpass",
            Record::EndRenderPass => "EndRenderPass",
            Record::BindGraphicsPipeline { .. } => "BindGraphicsPipeline",
            Record::SetViewport { .. } => "SetViewport",
            Record::SetScissor { .. } => "SetScissor",
            Record::SetStencilReference { .. } => "SetStencilReference",
            Record::SetBlendConstants { .. } => "SetBlendConstants",
            Record::BindIndexBuffer { .. } => "BindIndexBuffer",
            Record::BindVertexBuffers { .. } => "BindVertexBuffers",
            Record::Draw { .. } => "Draw",
            Record::DrawIndexed { .. } => "DrawIndexed",
            Record::DrawIndirect { .. } => "DrawIndirect",
            Record::DrawIndexedIndirect { .. } => "DrawIndexedIndirect",
            Record::DrawMeshTasks { .. } => "DrawMeshTasks",
            Record::BuildGeometry { .. } => "BuildGeometry",
            Record::BuildScene { .. } => "BuildScene",
            Record::CopyAccelerationStructure { .. } => "CopyAccelerationStructure",
            Record::WriteCompactedSize { .. } => "WriteCompactedSize",
            Record::BindRayTracingPipeline { .. } => "BindRayTracingPipeline",
            Record::SetStackSize { .. } => "SetStackSize",
            Record::TraceRays { .. } => "TraceRays",
            Record::TraceRaysIndirect { .. } => "TraceRaysIndirect",
        }
    }

    /// Kind started by a segment-begin record.
    pub fn begins(&self) -> Option<ContextKind> {
        match self {
            Record::BeginTransfer { .. } => Some(ContextKind::Transfer),
            Record::BeginCompute { .. } => Some(ContextKind::Compute),
            Record::BeginGraphics { .. } => Some(ContextKind::Graphics),
            Record::BeginAsBuild { .. } => Some(ContextKind::AsBuild),
            Record::BeginRayTracing { .. } => Some(ContextKind::RayTracing),
            _ => None,
        }
    }

    /// Context kinds in which this record may execute.
    pub fn allowed_kinds(&self) -> KindMask {
        match self {
            Record::BeginTransfer { .. }
            | Record::BeginCompute { .. }
            | Record::BeginGraphics { .. }
            | Record::BeginAsBuild { .. }
            | Record::BeginRayTracing { .. } => KindMask::PRIMARY,

            Record::DebugMarker { .. }
            | Record::PushDebugGroup { .. }
            | Record::PopDebugGroup
            | Record::WriteTimestamp { .. } => KindMask::ANY,

            Record::BufferBarrier { .. }
            | Record::BufferRangeBarrier { .. }
            | Record::ImageBarrier { .. }
            | Record::MemoryBarrier { .. }
            | Record::ExecutionBarrier { .. }
            | Record::AcquireBufferOwnership { .. }
            | Record::ReleaseBufferOwnership { .. }
            | Record::AcquireImageOwnership { .. }
            | Record::ReleaseImageOwnership { .. }
            | Record::CommitBarriers => KindMask::PRIMARY,

            Record::ClearColorImage { .. }
            | Record::ClearDepthStencilImage { .. }
            | Record::FillBuffer { .. }
            | Record::UpdateBuffer { .. }
            | Record::CopyBuffer { .. }
            | Record::CopyImage { .. }
            | Record::CopyBufferToImage { .. }
            | Record::CopyImageToBuffer { .. }
            | Record::GenerateMipmaps { .. }
            | Record::UploadBuffer { .. }
            | Record::ReadbackBuffer { .. } => KindMask::TRANSFER,

            Record::BindDescriptorSet { .. } | Record::PushConstant { .. } => KindMask::PIPELINE,

            Record::BindComputePipeline { .. }
            | Record::Dispatch { .. }
            | Record::DispatchIndirect { .. } => KindMask::COMPUTE,

            Record::BeginRenderPass { .. } => KindMask::GRAPHICS,
            Record::NextSubpass | Record::EndRenderPass => KindMask::RENDER_PASS,

            Record::BindGraphicsPipeline { .. }
            | Record::SetViewport { .. }
            | Record::SetScissor { .. }
            | Record::SetStencilReference { .. }
            | Record::SetBlendConstants { .. }
            | Record::BindIndexBuffer { .. }
            | Record::BindVertexBuffers { .. }
            | Record::Draw { .. }
            | Record::DrawIndexed { .. }
            | Record::DrawIndirect { .. }
            | Record::DrawIndexedIndirect { .. }
            | Record::DrawMeshTasks { .. } => KindMask::RENDER_PASS,

            Record::BuildGeometry { .. }
            | Record::BuildScene { .. }
            | Record::CopyAccelerationStructure { .. }
            | Record::WriteCompactedSize { .. } => KindMask::AS_BUILD,

            Record::BindRayTracingPipeline { .. }
            | Record::SetStackSize { .. }
            | Record::TraceRays { .. }
            | Record::TraceRaysIndirect { .. } => KindMask::RAY_TRACING,
        }
    }

    /// Encode into a standalone byte buffer.
    pub fn encode(&self) -> Result<Vec<u8>, crate::wire::WireError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|bytes| bytes.as_slice().to_vec())
            .map_err(|e| crate::wire::WireError::Serialization(e.to_string()))
    }

    /// Decode one record. `scratch` is cleared and reused to realign the
    /// input; callers keep one scratch buffer per replay and discard its
    /// contents after each record.
    pub fn decode(
        bytes: &[u8],
        scratch: &mut rkyv::util::AlignedVec<16>,
    ) -> Result<Self, crate::wire::WireError> {
        scratch.clear();
        scratch.extend_from_slice(bytes);
        rkyv::from_bytes::<Record, rkyv::rancor::Error>(scratch.as_slice())
            .map_err(|e| crate::wire::WireError::Serialization(e.to_string()))
    }
}

// ── Stream framing ──────────────────────────────────────────────────────

/// Every record in a baked stream is preceded by its length as a
/// little-endian `u32`.
pub const RECORD_PREFIX: usize = 4;

/// Append `record` to `out` with its length prefix.
pub fn write_record(out: &mut Vec<u8>, record: &Record) -> Result<usize, crate::wire::WireError> {
    let bytes = record.encode()?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| crate::wire::WireError::Malformed("record larger than 4 GiB".into()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&bytes);
    Ok(RECORD_PREFIX + bytes.len())
}

/// Walks the length-prefixed records of a baked stream without copying.
#[derive(Debug, Clone)]
pub struct RecordStream<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> RecordStream<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for RecordStream<'a> {
    type Item = Result<&'a [u8], crate::wire::WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.bytes[self.pos..];
        if rest.is_empty() {
            return None;
        }
        let Some(prefix) = rest.get(..RECORD_PREFIX) else {
            self.pos = self.bytes.len();
            return Some(Err(crate::wire::WireError::Truncated));
        };
        let mut len = [0u8; RECORD_PREFIX];
        len.copy_from_slice(prefix);
        let len = u32::from_le_bytes(len) as usize;
        match rest.get(RECORD_PREFIX..RECORD_PREFIX + len) {
            Some(record) => {
                self.pos += RECORD_PREFIX + len;
                Some(Ok(record))
            }
            None => {
                self.pos = self.bytes.len();
                Some(Err(crate::wire::WireError::Truncated))
            }
        }
    }
}
