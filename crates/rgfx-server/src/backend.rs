//! Native device seam.
//!
//! Submission, recording and staging have their own traits in `rgfx-core`.
//! [`ResourceBackend`] adds what the host dispatcher needs on top: resource
//! creation, descriptor updates, query pools and swapchains. [`GpuBackend`]
//! bundles all of them so a session can hold one `Arc<dyn GpuBackend>`.

use std::sync::Arc;

use rgfx_core::context::ContextFactory;
use rgfx_core::staging::StagingMemory;
use rgfx_core::{GfxError, Handle, HandleValidator, SubmitBackend};
use rgfx_protocol::types::{BufferDesc, ImageDesc, PixelFormat, QueryKind};
use rgfx_protocol::FrameId;

/// One descriptor write, with the resource already resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub element: u32,
    pub resource: Handle,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainImages {
    pub swapchain: Handle,
    pub images: Vec<Handle>,
}

/// What `describe` can say about a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceInfo {
    Buffer(BufferDesc),
    Image(ImageDesc),
    Other,
}

pub trait ResourceBackend: Send + Sync {
    fn device_name(&self) -> String;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Handle, GfxError>;
    fn create_image(&self, desc: &ImageDesc) -> Result<Handle, GfxError>;
    /// Pipelines are looked up by name in the host's pipeline library.
    fn load_pipeline(&self, name: &str) -> Result<Handle, GfxError>;
    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<Handle, GfxError>;
    fn create_descriptor_set(&self, pipeline: Handle, set_index: u32) -> Result<Handle, GfxError>;
    fn update_descriptor_set(&self, set: Handle, writes: &[DescriptorBinding]) -> Result<(), GfxError>;

    fn create_query_pool(&self, kind: QueryKind, count: u32) -> Result<Handle, GfxError>;
    fn read_queries(&self, pool: Handle, first: u32, count: u32) -> Result<Vec<u64>, GfxError>;

    /// Host write straight into buffer memory, outside any command buffer.
    fn write_buffer(&self, buffer: Handle, offset: u64, data: &[u8]) -> Result<(), GfxError>;

    fn create_swapchain(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        image_count: u32,
    ) -> Result<SwapchainImages, GfxError>;
    fn acquire_image(&self, swapchain: Handle) -> Result<(u32, Handle), GfxError>;
    fn present(&self, swapchain: Handle, image_index: u32) -> Result<(), GfxError>;

    fn describe(&self, handle: Handle) -> Option<ResourceInfo>;

    /// Drop the creator's reference. Destruction waits until the frame that
    /// last used the resource retires. False for a dead handle.
    fn release(&self, handle: Handle) -> bool;

    fn begin_frame(&self, frame: FrameId);
    fn retire_frame(&self, frame: FrameId);
    /// Destroy everything already released. Only valid once the device is idle.
    fn retire_all(&self);
}

/// Every seam a host device is driven through.
pub trait GpuBackend:
    SubmitBackend + ContextFactory + StagingMemory + ResourceBackend + HandleValidator
{
    fn submitter(self: Arc<Self>) -> Arc<dyn SubmitBackend>;
    fn contexts(self: Arc<Self>) -> Arc<dyn ContextFactory>;
    fn staging_memory(self: Arc<Self>) -> Arc<dyn StagingMemory>;
    fn validator(self: Arc<Self>) -> Arc<dyn HandleValidator>;
}

impl<T> GpuBackend for T
where
    T: SubmitBackend + ContextFactory + StagingMemory + ResourceBackend + HandleValidator + 'static,
{
    fn submitter(self: Arc<Self>) -> Arc<dyn SubmitBackend> {
        self
    }

    fn contexts(self: Arc<Self>) -> Arc<dyn ContextFactory> {
        self
    }

    fn staging_memory(self: Arc<Self>) -> Arc<dyn StagingMemory> {
        self
    }

    fn validator(self: Arc<Self>) -> Arc<dyn HandleValidator> {
        self
    }
}
