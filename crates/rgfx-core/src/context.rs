//! Context capability traits.
//!
//! A command buffer is recorded as a sequence of segments, each of one
//! primary kind. Graphics segments additionally enter and leave render
//! passes; draw calls are only legal inside one. Both the capture recorder
//! and native backends implement these traits, and [`KindTracker`] enforces
//! the segment rules on either side.

use rgfx_protocol::records::KindMask;
use rgfx_protocol::types::{
    BufferCopy, BufferImageCopy, ClearValue, ImageCopy, ImageSubresourceRange, IndexType,
    PipelineStages, Rect2, ResourceState, ShaderStages, Viewport,
};
use rgfx_protocol::{ContextKind, QueueType, Record};

use crate::barrier::BarrierSink;
use crate::error::GfxError;
use crate::handle::Handle;
use crate::staging::StagingRange;

// ── Argument types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attachment {
    pub image: Handle,
    pub clear: Option<ClearValue>,
    pub initial: ResourceState,
    pub final_state: ResourceState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassDesc {
    pub attachments: Vec<Attachment>,
    pub area: Rect2,
    pub layer_count: u32,
}

/// Bottom-level build over a geometry buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryBuild {
    pub dst: Handle,
    pub scratch: Handle,
    pub scratch_offset: u64,
    pub geometry: Handle,
    pub geometry_offset: u64,
    pub primitive_count: u32,
}

/// Top-level build over an instance buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneBuild {
    pub dst: Handle,
    pub scratch: Handle,
    pub scratch_offset: u64,
    pub instances: Handle,
    pub instances_offset: u64,
    pub instance_count: u32,
}

// ── Capability traits ───────────────────────────────────────────────────

/// Operations legal in every segment kind.
pub trait CommandContext: BarrierSink {
    fn kind(&self) -> ContextKind;

    fn debug_marker(&mut self, label: &str, color: u32);
    fn push_debug_group(&mut self, label: &str, color: u32);
    fn pop_debug_group(&mut self);
    fn write_timestamp(&mut self, query_pool: Handle, index: u32, stage: PipelineStages);

    /// Close the segment and report any error latched while recording it.
    fn finish(&mut self) -> Result<(), GfxError> {
        Ok(())
    }
}

pub trait TransferContext: CommandContext {
    fn clear_color_image(&mut self, image: Handle, color: [f32; 4], ranges: &[ImageSubresourceRange]);
    fn clear_depth_stencil_image(
        &mut self,
        image: Handle,
        depth: f32,
        stencil: u32,
        ranges: &[ImageSubresourceRange],
    );
    fn fill_buffer(&mut self, buffer: Handle, offset: u64, size: u64, data: u32);
    fn update_buffer(&mut self, buffer: Handle, offset: u64, data: &[u8]);
    fn copy_buffer(&mut self, src: Handle, dst: Handle, regions: &[BufferCopy]);
    fn copy_image(&mut self, src: Handle, dst: Handle, regions: &[ImageCopy]);
    fn copy_buffer_to_image(&mut self, src: Handle, dst: Handle, regions: &[BufferImageCopy]);
    fn copy_image_to_buffer(&mut self, src: Handle, dst: Handle, regions: &[BufferImageCopy]);
    fn generate_mipmaps(&mut self, image: Handle);
    /// Copy a whole staging range into `dst` at `dst_offset`.
    fn copy_from_staging(&mut self, src: &StagingRange, dst: Handle, dst_offset: u64);
    /// Fill a whole staging range from `src` starting at `src_offset`.
    fn copy_to_staging(&mut self, src: Handle, src_offset: u64, dst: &StagingRange);
}

pub trait ComputeContext: CommandContext {
    fn bind_compute_pipeline(&mut self, pipeline: Handle);
    fn bind_descriptor_set(&mut self, index: u32, set: Handle, dynamic_offsets: &[u32]);
    fn push_constant(&mut self, offset: u32, stages: ShaderStages, data: &[u8]);
    fn dispatch(&mut self, group_count: [u32; 3]);
    fn dispatch_indirect(&mut self, buffer: Handle, offset: u64);
}

pub trait GraphicsContext: CommandContext {
    fn begin_render_pass(&mut self, desc: &RenderPassDesc);
    fn next_subpass(&mut self);
    fn end_render_pass(&mut self);
    /// Draw-level recording. Only meaningful between begin and end render pass.
    fn draw_context(&mut self) -> &mut dyn DrawContext;
}

pub trait DrawContext {
    fn bind_graphics_pipeline(&mut self, pipeline: Handle);
    fn bind_descriptor_set(&mut self, index: u32, set: Handle, dynamic_offsets: &[u32]);
    fn push_constant(&mut self, offset: u32, stages: ShaderStages, data: &[u8]);
    fn set_viewport(&mut self, first: u32, viewports: &[Viewport]);
    fn set_scissor(&mut self, first: u32, scissors: &[Rect2]);
    fn set_stencil_reference(&mut self, value: u32);
    fn set_blend_constants(&mut self, color: [f32; 4]);
    fn bind_index_buffer(&mut self, buffer: Handle, offset: u64, index_type: IndexType);
    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[Handle], offsets: &[u64]);
    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn draw_indirect(&mut self, buffer: Handle, offset: u64, draw_count: u32, stride: u32);
    fn draw_indexed_indirect(&mut self, buffer: Handle, offset: u64, draw_count: u32, stride: u32);
    fn draw_mesh_tasks(&mut self, group_count: [u32; 3]);
}

pub trait AsBuildContext: CommandContext {
    fn build_geometry(&mut self, build: &GeometryBuild);
    fn build_scene(&mut self, build: &SceneBuild);
    fn copy_acceleration_structure(&mut self, src: Handle, dst: Handle, compact: bool);
    fn write_compacted_size(&mut self, src: Handle, query_pool: Handle, index: u32);
}

pub trait RayTracingContext: CommandContext {
    fn bind_ray_tracing_pipeline(&mut self, pipeline: Handle);
    fn bind_descriptor_set(&mut self, index: u32, set: Handle, dynamic_offsets: &[u32]);
    fn push_constant(&mut self, offset: u32, stages: ShaderStages, data: &[u8]);
    fn set_stack_size(&mut self, bytes: u32);
    fn trace_rays(&mut self, sbt: Handle, dim: [u32; 3]);
    fn trace_rays_indirect(&mut self, sbt: Handle, buffer: Handle, offset: u64);
}

/// Creates native command buffers and the per-kind contexts that record
/// into them.
pub trait ContextFactory: Send + Sync {
    fn begin_command_buffer(&self, queue: QueueType, label: &str) -> Result<Handle, GfxError>;

    fn transfer(&self, cmdbuf: Handle) -> Result<Box<dyn TransferContext + '_>, GfxError>;
    fn compute(&self, cmdbuf: Handle) -> Result<Box<dyn ComputeContext + '_>, GfxError>;
    fn graphics(&self, cmdbuf: Handle) -> Result<Box<dyn GraphicsContext + '_>, GfxError>;
    fn as_build(&self, cmdbuf: Handle) -> Result<Box<dyn AsBuildContext + '_>, GfxError>;
    fn ray_tracing(&self, cmdbuf: Handle) -> Result<Box<dyn RayTracingContext + '_>, GfxError>;

    /// Close recording. The command buffer is then ready for submission.
    fn end_command_buffer(&self, cmdbuf: Handle) -> Result<(), GfxError>;

    /// Throw away a partially recorded command buffer.
    fn discard_command_buffer(&self, cmdbuf: Handle);
}

// ── Kind state machine ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindTransition {
    /// Record runs in the active kind.
    Stay,
    /// A segment-begin record ended `ended` and started `started`.
    Begin { ended: ContextKind, started: ContextKind },
    EnterRenderPass,
    LeaveRenderPass,
}

/// Tracks the active context kind across a record sequence.
#[derive(Debug, Clone, Copy)]
pub struct KindTracker {
    active: ContextKind,
}

impl Default for KindTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl KindTracker {
    pub fn new() -> Self {
        Self { active: ContextKind::Unknown }
    }

    pub fn active(&self) -> ContextKind {
        self.active
    }

    /// Check `record` against the active kind and advance.
    pub fn apply(&mut self, record: &Record) -> Result<KindTransition, GfxError> {
        self.check(record.name(), record.begins(), record.allowed_kinds())?;
        Ok(self.advance(record))
    }

    pub fn check(
        &self,
        name: &'static str,
        begins: Option<ContextKind>,
        allowed: KindMask,
    ) -> Result<(), GfxError> {
        let mismatch = GfxError::KindMismatch { record: name, active: self.active };
        if begins.is_some() {
            return if self.active == ContextKind::RenderPass { Err(mismatch) } else { Ok(()) };
        }
        if self.active == ContextKind::Unknown || !allowed.contains(self.active.mask()) {
            return Err(mismatch);
        }
        Ok(())
    }

    fn advance(&mut self, record: &Record) -> KindTransition {
        if let Some(started) = record.begins() {
            let ended = self.active;
            self.active = started;
            return KindTransition::Begin { ended, started };
        }
        match record {
            Record::BeginRenderPass { .. } => {
                self.active = ContextKind::RenderPass;
                KindTransition::EnterRenderPass
            }
            Record::EndRenderPass => {
                self.active = ContextKind::Graphics;
                KindTransition::LeaveRenderPass
            }
            _ => KindTransition::Stay,
        }
    }

    /// A stream must not end inside a render pass.
    pub fn finish(&self) -> Result<(), GfxError> {
        if self.active == ContextKind::RenderPass {
            return Err(GfxError::validation("command stream ends inside a render pass"));
        }
        Ok(())
    }
}
