//! CPU-memory device.
//!
//! Buffers live in host memory. Fill, update, copy, staging upload and
//! readback commands really execute when their command buffer is submitted;
//! every other command is validated at record time and only counted.
//! Submissions queue per hardware queue and run as soon as their semaphore
//! waits are met, which signals their timeline values.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use rgfx_core::config::GraphicsConfig;
use rgfx_core::context::{
    AsBuildContext, CommandContext, ComputeContext, ContextFactory, DrawContext, GeometryBuild,
    GraphicsContext, RayTracingContext, RenderPassDesc, SceneBuild, TransferContext,
};
use rgfx_core::staging::{MappedMemory, StagingBuffer, StagingDirection, StagingMemory};
use rgfx_core::sync::{self, Submission};
use rgfx_core::{
    Barrier, BarrierSink, GfxError, Handle, HandleRegistry, HandleValidator, SemaphoreDep,
    SubmitBackend,
};
use rgfx_protocol::types::{
    BufferCopy, BufferDesc, BufferImageCopy, BufferUsage, ImageCopy, ImageDesc, ImageSubresourceRange,
    ImageUsage, IndexType, PipelineStages, PixelFormat, QueryKind, Rect2, ShaderStages, Viewport,
};
use rgfx_protocol::{ContextKind, FrameId, QueueType, ResourceType};

use crate::backend::{DescriptorBinding, ResourceBackend, ResourceInfo, SwapchainImages};

/// Largest single allocation the software device accepts.
pub const MAX_ALLOCATION: u64 = 1 << 30;

#[derive(Debug, Clone)]
pub struct SoftwareConfig {
    pub handle_capacity: usize,
    /// When false, completion is tracked with binary fences instead.
    pub timeline: bool,
    pub device_name: String,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self::from(&GraphicsConfig::default())
    }
}

impl From<&GraphicsConfig> for SoftwareConfig {
    fn from(config: &GraphicsConfig) -> Self {
        Self {
            handle_capacity: config.handle_capacity,
            timeline: true,
            device_name: "rgfx software device".to_string(),
        }
    }
}

// ── Resources ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Recording,
    Executable,
}

struct CommandList {
    queue: QueueType,
    label: String,
    state: ListState,
    ops: Vec<Op>,
}

struct SwapchainState {
    images: Vec<Handle>,
    next: AtomicU32,
    presented: AtomicU64,
}

#[derive(Clone)]
enum Resource {
    Buffer { desc: BufferDesc, memory: MappedMemory },
    Image { desc: ImageDesc, memory: MappedMemory },
    Pipeline { name: Arc<str> },
    DescriptorSet { pipeline: Handle, set_index: u32, bindings: Arc<Mutex<Vec<DescriptorBinding>>> },
    QueryPool { kind: QueryKind, values: Arc<Mutex<Vec<u64>>> },
    /// Timeline semaphores and binary fences; their state lives in the
    /// timeline table.
    Sync,
    CommandBuffer(Arc<Mutex<CommandList>>),
    Swapchain(Arc<SwapchainState>),
}

fn image_bytes(desc: &ImageDesc) -> u64 {
    let info = desc.format.info();
    let width = u64::from(desc.dimension.width.div_ceil(info.block_width));
    let height = u64::from(desc.dimension.height.div_ceil(info.block_height));
    let row = (width * u64::from(info.bits_per_block)).div_ceil(8);
    row * height * u64::from(desc.dimension.depth.max(1)) * u64::from(desc.array_layers.max(1))
}

fn allocation(size: u64) -> Result<usize, GfxError> {
    if size > MAX_ALLOCATION {
        return Err(GfxError::ResourceExhausted(format!(
            "allocation of {} bytes exceeds the software device limit of {}",
            size, MAX_ALLOCATION
        )));
    }
    usize::try_from(size).map_err(|_| GfxError::ResourceExhausted("allocation overflows usize".into()))
}

// ── Commands ────────────────────────────────────────────────────────────

enum Op {
    Fill { dst: MappedMemory, offset: u64, size: u64, data: u32 },
    Write { dst: MappedMemory, offset: u64, data: Vec<u8> },
    Copy { src: MappedMemory, dst: MappedMemory, regions: Vec<BufferCopy> },
    Timestamp { values: Arc<Mutex<Vec<u64>>>, index: u32 },
    QueryWrite { values: Arc<Mutex<Vec<u64>>>, index: u32, value: u64 },
    Barriers(usize),
    Counted(&'static str),
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Fill { .. } => "FillBuffer",
            Op::Write { .. } => "UpdateBuffer",
            Op::Copy { .. } => "CopyBuffer",
            Op::Timestamp { .. } => "WriteTimestamp",
            Op::QueryWrite { .. } => "WriteQuery",
            Op::Barriers(_) => "Barriers",
            Op::Counted(name) => name,
        }
    }

    fn execute(&self, epoch: Instant) -> Result<(), GfxError> {
        match self {
            Op::Fill { dst, offset, size, data } => {
                let pattern = data.to_le_bytes();
                let bytes: Vec<u8> = (0..*size as usize).map(|i| pattern[i % 4]).collect();
                dst.write(*offset, &bytes)
            }
            Op::Write { dst, offset, data } => dst.write(*offset, data),
            Op::Copy { src, dst, regions } => {
                for region in regions {
                    let bytes = src.read_vec(region.src_offset, region.size as usize)?;
                    dst.write(region.dst_offset, &bytes)?;
                }
                Ok(())
            }
            Op::Timestamp { values, index } => {
                let now = u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
                if let Some(slot) = values.lock().get_mut(*index as usize) {
                    *slot = now;
                }
                Ok(())
            }
            Op::QueryWrite { values, index, value } => {
                if let Some(slot) = values.lock().get_mut(*index as usize) {
                    *slot = *value;
                }
                Ok(())
            }
            Op::Barriers(_) | Op::Counted(_) => Ok(()),
        }
    }
}

// ── Timeline ────────────────────────────────────────────────────────────

struct Queued {
    lists: Vec<Arc<Mutex<CommandList>>>,
    waits: Vec<SemaphoreDep>,
    signals: Vec<SemaphoreDep>,
    fence: Option<Handle>,
}

#[derive(Default)]
struct Timeline {
    values: HashMap<Handle, u64>,
    fences: HashMap<Handle, bool>,
    queues: [VecDeque<Queued>; QueueType::COUNT],
}

impl Timeline {
    fn reached(&self, dep: &SemaphoreDep) -> bool {
        self.values.get(&dep.semaphore).copied().unwrap_or(0) >= dep.value
    }
}

// ── Device ──────────────────────────────────────────────────────────────

pub struct SoftwareBackend {
    config: SoftwareConfig,
    resources: HandleRegistry<Resource>,
    timeline: Mutex<Timeline>,
    progressed: Condvar,
    counters: Mutex<HashMap<&'static str, u64>>,
    submissions: AtomicU64,
    epoch: Instant,
}

impl SoftwareBackend {
    pub fn new(config: SoftwareConfig) -> Self {
        debug!(device = %config.device_name, timeline = config.timeline, "software device created");
        Self {
            resources: HandleRegistry::new("software", config.handle_capacity),
            config,
            timeline: Mutex::new(Timeline::default()),
            progressed: Condvar::new(),
            counters: Mutex::new(HashMap::new()),
            submissions: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Times an executed command of this name has run.
    pub fn op_count(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    pub fn live_resources(&self) -> usize {
        self.resources.live_count()
    }

    /// Copy of a buffer's current contents.
    pub fn read_buffer(&self, buffer: Handle, offset: u64, len: usize) -> Result<Vec<u8>, GfxError> {
        self.buffer_memory(buffer)?.read_vec(offset, len)
    }

    fn allocate(&self, kind: ResourceType, value: Resource) -> Result<Handle, GfxError> {
        let handle = self.resources.allocate(kind, value);
        if handle.is_valid() {
            Ok(handle)
        } else {
            Err(GfxError::ResourceExhausted(format!(
                "software device holds {} resources",
                self.resources.capacity()
            )))
        }
    }

    fn lookup(&self, handle: Handle) -> Result<Resource, GfxError> {
        self.resources.get(handle).ok_or(GfxError::StaleHandle(handle))
    }

    fn buffer_memory(&self, handle: Handle) -> Result<MappedMemory, GfxError> {
        match self.lookup(handle)? {
            Resource::Buffer { memory, .. } => Ok(memory),
            _ => Err(GfxError::validation(format!("{} is not a buffer", handle))),
        }
    }

    fn command_list(&self, cmdbuf: Handle) -> Result<Arc<Mutex<CommandList>>, GfxError> {
        match self.lookup(cmdbuf)? {
            Resource::CommandBuffer(list) => Ok(list),
            _ => Err(GfxError::validation(format!("{} is not a command buffer", cmdbuf))),
        }
    }

    fn recording_list(&self, cmdbuf: Handle) -> Result<Arc<Mutex<CommandList>>, GfxError> {
        let list = self.command_list(cmdbuf)?;
        if list.lock().state != ListState::Recording {
            return Err(GfxError::validation(format!("{} is not recording", cmdbuf)));
        }
        Ok(list)
    }

    fn context(&self, cmdbuf: Handle, kind: ContextKind) -> Result<SoftwareContext<'_>, GfxError> {
        let list = self.recording_list(cmdbuf)?;
        trace!(%cmdbuf, ?kind, "context opened");
        Ok(SoftwareContext { device: self, list, kind, in_render_pass: false, depth: 0, error: None })
    }

    /// Run every queued submission whose waits are satisfied, in queue order,
    /// until nothing more can run.
    fn pump(&self, timeline: &mut Timeline) {
        loop {
            let mut progressed = false;
            for queue in 0..QueueType::COUNT {
                loop {
                    let ready = match timeline.queues[queue].front() {
                        Some(front) => front.waits.iter().all(|dep| timeline.reached(dep)),
                        None => false,
                    };
                    if !ready {
                        break;
                    }
                    let Some(queued) = timeline.queues[queue].pop_front() else {
                        break;
                    };
                    self.execute(&queued);
                    for signal in &queued.signals {
                        let value = timeline.values.entry(signal.semaphore).or_insert(0);
                        *value = (*value).max(signal.value);
                    }
                    if let Some(fence) = queued.fence {
                        timeline.fences.insert(fence, true);
                    }
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        self.progressed.notify_all();
    }

    fn execute(&self, queued: &Queued) {
        let mut counters = self.counters.lock();
        for list in &queued.lists {
            let list = list.lock();
            for op in &list.ops {
                if let Err(e) = op.execute(self.epoch) {
                    warn!(label = %list.label, op = op.name(), error = %e, "command failed");
                }
                let count = match op {
                    Op::Barriers(n) => *n as u64,
                    _ => 1,
                };
                *counters.entry(op.name()).or_insert(0) += count;
            }
        }
    }

    fn wait_until(&self, deadline: Instant, done: impl Fn(&Timeline) -> bool) -> bool {
        let mut timeline = self.timeline.lock();
        while !done(&timeline) {
            if self.progressed.wait_until(&mut timeline, deadline).timed_out() {
                return done(&timeline);
            }
        }
        true
    }
}

impl HandleValidator for SoftwareBackend {
    fn is_alive(&self, handle: Handle) -> bool {
        self.resources.is_alive(handle)
    }
}

impl SubmitBackend for SoftwareBackend {
    fn supports_timeline(&self) -> bool {
        self.config.timeline
    }

    fn create_semaphore(&self) -> Result<Handle, GfxError> {
        self.create_timeline_semaphore(0)
    }

    fn destroy_semaphore(&self, semaphore: Handle) {
        self.resources.release(semaphore);
    }

    fn submit(&self, submission: &Submission<'_>) -> Result<(), GfxError> {
        let mut lists = Vec::with_capacity(submission.command_buffers.len());
        for cmdbuf in submission.command_buffers {
            let list = self.command_list(*cmdbuf)?;
            {
                let guard = list.lock();
                if guard.state != ListState::Executable {
                    return Err(GfxError::validation(format!("{} was never ended", cmdbuf)));
                }
                if guard.queue != submission.queue {
                    return Err(GfxError::validation(format!(
                        "{} was recorded for {:?}, submitted to {:?}",
                        cmdbuf, guard.queue, submission.queue
                    )));
                }
            }
            lists.push(list);
        }

        let mut timeline = self.timeline.lock();
        timeline.queues[submission.queue.index()].push_back(Queued {
            lists,
            waits: submission.waits.to_vec(),
            signals: submission.signals.to_vec(),
            fence: submission.fence,
        });
        self.submissions.fetch_add(1, Ordering::Relaxed);
        trace!(queue = ?submission.queue, cmd_buffers = submission.command_buffers.len(), "submitted");
        self.pump(&mut timeline);
        Ok(())
    }

    fn signaled_value(&self, semaphore: Handle) -> u64 {
        self.timeline.lock().values.get(&semaphore).copied().unwrap_or(0)
    }

    fn wait(&self, deps: &[SemaphoreDep], timeout: Duration) -> bool {
        let deadline = sync::deadline(timeout);
        self.wait_until(deadline, |timeline| deps.iter().all(|dep| timeline.reached(dep)))
    }

    fn create_fence(&self) -> Result<Handle, GfxError> {
        // Binary fences share the semaphore kind.
        let fence = self.allocate(ResourceType::Semaphore, Resource::Sync)?;
        self.timeline.lock().fences.insert(fence, false);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: Handle) {
        self.resources.release(fence);
    }

    fn is_fence_signaled(&self, fence: Handle) -> bool {
        self.timeline.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    fn wait_fence(&self, fence: Handle, timeout: Duration) -> bool {
        let deadline = sync::deadline(timeout);
        self.wait_until(deadline, |timeline| timeline.fences.get(&fence).copied().unwrap_or(false))
    }
}

impl StagingMemory for SoftwareBackend {
    fn create_staging_buffer(
        &self,
        size: u64,
        direction: StagingDirection,
    ) -> Result<StagingBuffer, GfxError> {
        let memory = MappedMemory::new(allocation(size)?);
        let desc = BufferDesc::new(size, BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST);
        let buffer =
            self.allocate(ResourceType::Buffer, Resource::Buffer { desc, memory: memory.clone() })?;
        debug!(%buffer, size, ?direction, "staging buffer created");
        Ok(StagingBuffer { buffer, capacity: size, mapped: memory })
    }

    fn destroy_staging_buffer(&self, buffer: Handle) {
        self.resources.release(buffer);
    }
}

impl ResourceBackend for SoftwareBackend {
    fn device_name(&self) -> String {
        self.config.device_name.clone()
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Handle, GfxError> {
        if desc.size == 0 {
            return Err(GfxError::validation("buffer size must be non-zero"));
        }
        let memory = MappedMemory::new(allocation(desc.size)?);
        self.allocate(ResourceType::Buffer, Resource::Buffer { desc: *desc, memory })
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<Handle, GfxError> {
        let size = image_bytes(desc);
        if size == 0 {
            return Err(GfxError::validation("image extent must be non-zero"));
        }
        let memory = MappedMemory::new(allocation(size)?);
        self.allocate(ResourceType::Image, Resource::Image { desc: *desc, memory })
    }

    fn load_pipeline(&self, name: &str) -> Result<Handle, GfxError> {
        if name.is_empty() {
            return Err(GfxError::validation("pipeline name must not be empty"));
        }
        self.allocate(ResourceType::Pipeline, Resource::Pipeline { name: Arc::from(name) })
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<Handle, GfxError> {
        let semaphore = self.allocate(ResourceType::Semaphore, Resource::Sync)?;
        self.timeline.lock().values.insert(semaphore, initial_value);
        Ok(semaphore)
    }

    fn create_descriptor_set(&self, pipeline: Handle, set_index: u32) -> Result<Handle, GfxError> {
        let Resource::Pipeline { name } = self.lookup(pipeline)? else {
            return Err(GfxError::validation(format!("{} is not a pipeline", pipeline)));
        };
        trace!(%pipeline, pipeline_name = %name, set_index, "descriptor set created");
        self.allocate(
            ResourceType::DescriptorSet,
            Resource::DescriptorSet { pipeline, set_index, bindings: Arc::default() },
        )
    }

    fn update_descriptor_set(&self, set: Handle, writes: &[DescriptorBinding]) -> Result<(), GfxError> {
        let Resource::DescriptorSet { pipeline, set_index, bindings } = self.lookup(set)? else {
            return Err(GfxError::validation(format!("{} is not a descriptor set", set)));
        };
        for write in writes {
            if !self.resources.is_alive(write.resource) {
                return Err(GfxError::StaleHandle(write.resource));
            }
        }
        let mut bindings = bindings.lock();
        for write in writes {
            bindings.retain(|b| (b.binding, b.element) != (write.binding, write.element));
            bindings.push(*write);
        }
        trace!(%set, %pipeline, set_index, writes = writes.len(), "descriptor set updated");
        Ok(())
    }

    fn create_query_pool(&self, kind: QueryKind, count: u32) -> Result<Handle, GfxError> {
        if count == 0 {
            return Err(GfxError::validation("query pool must hold at least one query"));
        }
        let values = Arc::new(Mutex::new(vec![0u64; count as usize]));
        self.allocate(ResourceType::QueryPool, Resource::QueryPool { kind, values })
    }

    fn read_queries(&self, pool: Handle, first: u32, count: u32) -> Result<Vec<u64>, GfxError> {
        let Resource::QueryPool { values, .. } = self.lookup(pool)? else {
            return Err(GfxError::validation(format!("{} is not a query pool", pool)));
        };
        let values = values.lock();
        let start = first as usize;
        let end = start + count as usize;
        values.get(start..end).map(<[u64]>::to_vec).ok_or_else(|| {
            GfxError::validation(format!(
                "queries {}..{} outside pool of {}",
                start,
                end,
                values.len()
            ))
        })
    }

    fn write_buffer(&self, buffer: Handle, offset: u64, data: &[u8]) -> Result<(), GfxError> {
        self.buffer_memory(buffer)?.write(offset, data)
    }

    fn create_swapchain(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        image_count: u32,
    ) -> Result<SwapchainImages, GfxError> {
        if image_count == 0 {
            return Err(GfxError::validation("swapchain needs at least one image"));
        }
        let desc = ImageDesc::new_2d(
            width,
            height,
            format,
            ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST,
        );
        let mut images = Vec::with_capacity(image_count as usize);
        for _ in 0..image_count {
            match self.create_image(&desc) {
                Ok(image) => images.push(image),
                Err(e) => {
                    for image in images {
                        self.resources.release(image);
                    }
                    return Err(e);
                }
            }
        }
        let state = SwapchainState {
            images: images.clone(),
            next: AtomicU32::new(0),
            presented: AtomicU64::new(0),
        };
        let swapchain = self.allocate(ResourceType::Swapchain, Resource::Swapchain(Arc::new(state)))?;
        debug!(%swapchain, width, height, ?format, image_count, "swapchain created");
        Ok(SwapchainImages { swapchain, images })
    }

    fn acquire_image(&self, swapchain: Handle) -> Result<(u32, Handle), GfxError> {
        let Resource::Swapchain(state) = self.lookup(swapchain)? else {
            return Err(GfxError::validation(format!("{} is not a swapchain", swapchain)));
        };
        let count = state.images.len() as u32;
        let index = state.next.fetch_add(1, Ordering::Relaxed) % count;
        Ok((index, state.images[index as usize]))
    }

    fn present(&self, swapchain: Handle, image_index: u32) -> Result<(), GfxError> {
        let Resource::Swapchain(state) = self.lookup(swapchain)? else {
            return Err(GfxError::validation(format!("{} is not a swapchain", swapchain)));
        };
        if image_index as usize >= state.images.len() {
            return Err(GfxError::validation(format!(
                "image index {} outside swapchain of {}",
                image_index,
                state.images.len()
            )));
        }
        let presented = state.presented.fetch_add(1, Ordering::Relaxed) + 1;
        *self.counters.lock().entry("Present").or_insert(0) += 1;
        trace!(%swapchain, image_index, presented, "presented");
        Ok(())
    }

    fn describe(&self, handle: Handle) -> Option<ResourceInfo> {
        self.resources.with(handle, |resource| match resource {
            Resource::Buffer { desc, .. } => ResourceInfo::Buffer(*desc),
            Resource::Image { desc, .. } => ResourceInfo::Image(*desc),
            _ => ResourceInfo::Other,
        })
    }

    fn release(&self, handle: Handle) -> bool {
        if let Some(Resource::Swapchain(state)) = self.resources.get(handle) {
            if self.resources.ref_count(handle) == 1 {
                for image in &state.images {
                    self.resources.release(*image);
                }
            }
        }
        self.resources.release(handle)
    }

    fn begin_frame(&self, frame: FrameId) {
        self.resources.set_current_frame(frame);
    }

    fn retire_frame(&self, frame: FrameId) {
        let destroyed = self.resources.retire(frame);
        self.forget(&destroyed);
    }

    fn retire_all(&self) {
        let destroyed = self.resources.retire_all();
        self.forget(&destroyed);
    }
}

impl SoftwareBackend {
    fn forget(&self, destroyed: &[(Handle, Resource)]) {
        if destroyed.is_empty() {
            return;
        }
        let mut timeline = self.timeline.lock();
        for (handle, resource) in destroyed {
            if let Resource::Sync = resource {
                timeline.values.remove(handle);
                timeline.fences.remove(handle);
            }
        }
        trace!(count = destroyed.len(), "resources destroyed");
    }
}

impl ContextFactory for SoftwareBackend {
    fn begin_command_buffer(&self, queue: QueueType, label: &str) -> Result<Handle, GfxError> {
        let list = CommandList {
            queue,
            label: label.to_string(),
            state: ListState::Recording,
            ops: Vec::new(),
        };
        self.allocate(ResourceType::CommandBuffer, Resource::CommandBuffer(Arc::new(Mutex::new(list))))
    }

    fn transfer(&self, cmdbuf: Handle) -> Result<Box<dyn TransferContext + '_>, GfxError> {
        Ok(Box::new(self.context(cmdbuf, ContextKind::Transfer)?))
    }

    fn compute(&self, cmdbuf: Handle) -> Result<Box<dyn ComputeContext + '_>, GfxError> {
        Ok(Box::new(self.context(cmdbuf, ContextKind::Compute)?))
    }

    fn graphics(&self, cmdbuf: Handle) -> Result<Box<dyn GraphicsContext + '_>, GfxError> {
        Ok(Box::new(self.context(cmdbuf, ContextKind::Graphics)?))
    }

    fn as_build(&self, cmdbuf: Handle) -> Result<Box<dyn AsBuildContext + '_>, GfxError> {
        Ok(Box::new(self.context(cmdbuf, ContextKind::AsBuild)?))
    }

    fn ray_tracing(&self, cmdbuf: Handle) -> Result<Box<dyn RayTracingContext + '_>, GfxError> {
        Ok(Box::new(self.context(cmdbuf, ContextKind::RayTracing)?))
    }

    fn end_command_buffer(&self, cmdbuf: Handle) -> Result<(), GfxError> {
        let list = self.recording_list(cmdbuf)?;
        let mut list = list.lock();
        list.state = ListState::Executable;
        trace!(%cmdbuf, label = %list.label, ops = list.ops.len(), "command buffer ended");
        Ok(())
    }

    fn discard_command_buffer(&self, cmdbuf: Handle) {
        if let Ok(list) = self.command_list(cmdbuf) {
            list.lock().ops.clear();
        }
        self.resources.release(cmdbuf);
    }
}

// ── Recording ───────────────────────────────────────────────────────────

/// Records into one command list. The first invalid argument is latched and
/// returned from `finish`; later commands are dropped.
struct SoftwareContext<'a> {
    device: &'a SoftwareBackend,
    list: Arc<Mutex<CommandList>>,
    kind: ContextKind,
    in_render_pass: bool,
    depth: u32,
    error: Option<GfxError>,
}

impl SoftwareContext<'_> {
    fn fail(&mut self, err: GfxError) {
        if self.error.is_none() {
            debug!(kind = ?self.kind, error = %err, "recording error latched");
            self.error = Some(err);
        }
    }

    fn push(&mut self, op: Op) {
        if self.error.is_none() {
            self.list.lock().ops.push(op);
        }
    }

    fn count(&mut self, name: &'static str) {
        self.push(Op::Counted(name));
    }

    fn resource(&mut self, handle: Handle) -> Option<Resource> {
        match self.device.lookup(handle) {
            Ok(resource) => Some(resource),
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }

    /// Check that `handle` is alive and of `kind`.
    fn expect(&mut self, handle: Handle, kind: ResourceType) -> bool {
        if self.resource(handle).is_none() {
            return false;
        }
        if handle.kind() != kind {
            self.fail(GfxError::validation(format!("{} used where a {:?} is required", handle, kind)));
            return false;
        }
        true
    }

    fn buffer(&mut self, handle: Handle, offset: u64, size: u64) -> Option<MappedMemory> {
        let memory = match self.resource(handle)? {
            Resource::Buffer { memory, .. } => memory,
            _ => {
                self.fail(GfxError::validation(format!("{} is not a buffer", handle)));
                return None;
            }
        };
        let fits = offset.checked_add(size).is_some_and(|end| end <= memory.len() as u64);
        if !fits {
            self.fail(GfxError::validation(format!(
                "{}..+{} outside {} of {} bytes",
                offset,
                size,
                handle,
                memory.len()
            )));
            return None;
        }
        Some(memory)
    }

    fn query_pool(&mut self, handle: Handle, index: u32, want: QueryKind) -> Option<Arc<Mutex<Vec<u64>>>> {
        let Resource::QueryPool { kind, values } = self.resource(handle)? else {
            self.fail(GfxError::validation(format!("{} is not a query pool", handle)));
            return None;
        };
        if kind != want {
            self.fail(GfxError::validation(format!("{} holds {:?} queries, not {:?}", handle, kind, want)));
            return None;
        }
        if index as usize >= values.lock().len() {
            self.fail(GfxError::validation(format!("query {} outside {}", index, handle)));
            return None;
        }
        Some(values)
    }

    fn images(&mut self, images: &[Handle]) -> bool {
        images.iter().all(|image| self.expect(*image, ResourceType::Image))
    }

    fn draw_op(&mut self, name: &'static str) {
        if !self.in_render_pass {
            self.fail(GfxError::validation(format!("{} outside a render pass", name)));
            return;
        }
        self.count(name);
    }
}

impl BarrierSink for SoftwareContext<'_> {
    fn commit_barriers(&mut self, barriers: &[Barrier]) {
        for barrier in barriers {
            if let Some(resource) = barrier.resource() {
                if self.resource(resource).is_none() {
                    return;
                }
            }
        }
        self.push(Op::Barriers(barriers.len()));
    }
}

impl CommandContext for SoftwareContext<'_> {
    fn kind(&self) -> ContextKind {
        if self.in_render_pass {
            ContextKind::RenderPass
        } else {
            self.kind
        }
    }

    fn debug_marker(&mut self, _label: &str, _color: u32) {
        self.count("DebugMarker");
    }

    fn push_debug_group(&mut self, _label: &str, _color: u32) {
        self.depth += 1;
        self.count("PushDebugGroup");
    }

    fn pop_debug_group(&mut self) {
        if self.depth == 0 {
            self.fail(GfxError::validation("pop_debug_group without a matching push"));
            return;
        }
        self.depth -= 1;
        self.count("PopDebugGroup");
    }

    fn write_timestamp(&mut self, query_pool: Handle, index: u32, _stage: PipelineStages) {
        if let Some(values) = self.query_pool(query_pool, index, QueryKind::Timestamp) {
            self.push(Op::Timestamp { values, index });
        }
    }

    fn finish(&mut self) -> Result<(), GfxError> {
        if self.in_render_pass {
            self.fail(GfxError::validation("segment closed inside a render pass"));
        }
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl TransferContext for SoftwareContext<'_> {
    fn clear_color_image(&mut self, image: Handle, _color: [f32; 4], _ranges: &[ImageSubresourceRange]) {
        if self.expect(image, ResourceType::Image) {
            self.count("ClearColorImage");
        }
    }

    fn clear_depth_stencil_image(
        &mut self,
        image: Handle,
        _depth: f32,
        _stencil: u32,
        _ranges: &[ImageSubresourceRange],
    ) {
        if self.expect(image, ResourceType::Image) {
            self.count("ClearDepthStencilImage");
        }
    }

    fn fill_buffer(&mut self, buffer: Handle, offset: u64, size: u64, data: u32) {
        if let Some(dst) = self.buffer(buffer, offset, size) {
            self.push(Op::Fill { dst, offset, size, data });
        }
    }

    fn update_buffer(&mut self, buffer: Handle, offset: u64, data: &[u8]) {
        if let Some(dst) = self.buffer(buffer, offset, data.len() as u64) {
            self.push(Op::Write { dst, offset, data: data.to_vec() });
        }
    }

    fn copy_buffer(&mut self, src: Handle, dst: Handle, regions: &[BufferCopy]) {
        let mut source = None;
        let mut target = None;
        for region in regions {
            source = self.buffer(src, region.src_offset, region.size);
            target = self.buffer(dst, region.dst_offset, region.size);
            if source.is_none() || target.is_none() {
                return;
            }
        }
        if let (Some(src), Some(dst)) = (source, target) {
            self.push(Op::Copy { src, dst, regions: regions.to_vec() });
        }
    }

    fn copy_image(&mut self, src: Handle, dst: Handle, _regions: &[ImageCopy]) {
        if self.images(&[src, dst]) {
            self.count("CopyImage");
        }
    }

    fn copy_buffer_to_image(&mut self, src: Handle, dst: Handle, _regions: &[BufferImageCopy]) {
        if self.expect(src, ResourceType::Buffer) && self.expect(dst, ResourceType::Image) {
            self.count("CopyBufferToImage");
        }
    }

    fn copy_image_to_buffer(&mut self, src: Handle, dst: Handle, _regions: &[BufferImageCopy]) {
        if self.expect(src, ResourceType::Image) && self.expect(dst, ResourceType::Buffer) {
            self.count("CopyImageToBuffer");
        }
    }

    fn generate_mipmaps(&mut self, image: Handle) {
        if self.expect(image, ResourceType::Image) {
            self.count("GenerateMipmaps");
        }
    }

    fn copy_from_staging(&mut self, src: &rgfx_core::StagingRange, dst: Handle, dst_offset: u64) {
        if let Some(target) = self.buffer(dst, dst_offset, src.size) {
            self.push(Op::Copy {
                src: src.mapped.clone(),
                dst: target,
                regions: vec![BufferCopy { src_offset: src.offset, dst_offset, size: src.size }],
            });
        }
    }

    fn copy_to_staging(&mut self, src: Handle, src_offset: u64, dst: &rgfx_core::StagingRange) {
        if let Some(source) = self.buffer(src, src_offset, dst.size) {
            self.push(Op::Copy {
                src: source,
                dst: dst.mapped.clone(),
                regions: vec![BufferCopy { src_offset, dst_offset: dst.offset, size: dst.size }],
            });
        }
    }
}

impl ComputeContext for SoftwareContext<'_> {
    fn bind_compute_pipeline(&mut self, pipeline: Handle) {
        if self.expect(pipeline, ResourceType::Pipeline) {
            self.count("BindComputePipeline");
        }
    }

    fn bind_descriptor_set(&mut self, _index: u32, set: Handle, _dynamic_offsets: &[u32]) {
        if self.expect(set, ResourceType::DescriptorSet) {
            self.count("BindDescriptorSet");
        }
    }

    fn push_constant(&mut self, _offset: u32, _stages: ShaderStages, _data: &[u8]) {
        self.count("PushConstant");
    }

    fn dispatch(&mut self, _group_count: [u32; 3]) {
        self.count("Dispatch");
    }

    fn dispatch_indirect(&mut self, buffer: Handle, offset: u64) {
        if self.buffer(buffer, offset, 12).is_some() {
            self.count("DispatchIndirect");
        }
    }
}

impl GraphicsContext for SoftwareContext<'_> {
    fn begin_render_pass(&mut self, desc: &RenderPassDesc) {
        if self.in_render_pass {
            self.fail(GfxError::validation("render pass already open"));
            return;
        }
        let images: Vec<Handle> = desc.attachments.iter().map(|a| a.image).collect();
        if self.images(&images) {
            self.in_render_pass = true;
            self.count("BeginRenderPass");
        }
    }

    fn next_subpass(&mut self) {
        self.draw_op("NextSubpass");
    }

    fn end_render_pass(&mut self) {
        if !self.in_render_pass {
            self.fail(GfxError::validation("end_render_pass without begin"));
            return;
        }
        self.in_render_pass = false;
        self.count("EndRenderPass");
    }

    fn draw_context(&mut self) -> &mut dyn DrawContext {
        self
    }
}

impl DrawContext for SoftwareContext<'_> {
    fn bind_graphics_pipeline(&mut self, pipeline: Handle) {
        if self.expect(pipeline, ResourceType::Pipeline) {
            self.draw_op("BindGraphicsPipeline");
        }
    }

    fn bind_descriptor_set(&mut self, _index: u32, set: Handle, _dynamic_offsets: &[u32]) {
        if self.expect(set, ResourceType::DescriptorSet) {
            self.draw_op("BindDescriptorSet");
        }
    }

    fn push_constant(&mut self, _offset: u32, _stages: ShaderStages, _data: &[u8]) {
        self.draw_op("PushConstant");
    }

    fn set_viewport(&mut self, _first: u32, _viewports: &[Viewport]) {
        self.draw_op("SetViewport");
    }

    fn set_scissor(&mut self, _first: u32, _scissors: &[Rect2]) {
        self.draw_op("SetScissor");
    }

    fn set_stencil_reference(&mut self, _value: u32) {
        self.draw_op("SetStencilReference");
    }

    fn set_blend_constants(&mut self, _color: [f32; 4]) {
        self.draw_op("SetBlendConstants");
    }

    fn bind_index_buffer(&mut self, buffer: Handle, _offset: u64, _index_type: IndexType) {
        if self.expect(buffer, ResourceType::Buffer) {
            self.draw_op("BindIndexBuffer");
        }
    }

    fn bind_vertex_buffers(&mut self, _first_binding: u32, buffers: &[Handle], offsets: &[u64]) {
        if buffers.len() != offsets.len() {
            self.fail(GfxError::validation("vertex buffer and offset counts differ"));
            return;
        }
        if buffers.iter().all(|b| self.expect(*b, ResourceType::Buffer)) {
            self.draw_op("BindVertexBuffers");
        }
    }

    fn draw(&mut self, _vertex_count: u32, _instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.draw_op("Draw");
    }

    fn draw_indexed(
        &mut self,
        _index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.draw_op("DrawIndexed");
    }

    fn draw_indirect(&mut self, buffer: Handle, _offset: u64, _draw_count: u32, _stride: u32) {
        if self.expect(buffer, ResourceType::Buffer) {
            self.draw_op("DrawIndirect");
        }
    }

    fn draw_indexed_indirect(&mut self, buffer: Handle, _offset: u64, _draw_count: u32, _stride: u32) {
        if self.expect(buffer, ResourceType::Buffer) {
            self.draw_op("DrawIndexedIndirect");
        }
    }

    fn draw_mesh_tasks(&mut self, _group_count: [u32; 3]) {
        self.draw_op("DrawMeshTasks");
    }
}

impl AsBuildContext for SoftwareContext<'_> {
    fn build_geometry(&mut self, build: &GeometryBuild) {
        let ok = [build.dst, build.scratch, build.geometry]
            .iter()
            .all(|h| self.expect(*h, ResourceType::Buffer));
        if ok {
            self.count("BuildGeometry");
        }
    }

    fn build_scene(&mut self, build: &SceneBuild) {
        let ok = [build.dst, build.scratch, build.instances]
            .iter()
            .all(|h| self.expect(*h, ResourceType::Buffer));
        if ok {
            self.count("BuildScene");
        }
    }

    fn copy_acceleration_structure(&mut self, src: Handle, dst: Handle, _compact: bool) {
        if self.expect(src, ResourceType::Buffer) && self.expect(dst, ResourceType::Buffer) {
            self.count("CopyAccelerationStructure");
        }
    }

    /// Acceleration structures are plain buffers here, so the compacted size
    /// is the buffer size.
    fn write_compacted_size(&mut self, src: Handle, query_pool: Handle, index: u32) {
        let Some(Resource::Buffer { memory, .. }) = self.resource(src) else {
            self.fail(GfxError::validation(format!("{} is not an acceleration structure", src)));
            return;
        };
        if let Some(values) = self.query_pool(query_pool, index, QueryKind::AccelStructCompactedSize) {
            self.push(Op::QueryWrite { values, index, value: memory.len() as u64 });
        }
    }
}

impl RayTracingContext for SoftwareContext<'_> {
    fn bind_ray_tracing_pipeline(&mut self, pipeline: Handle) {
        if self.expect(pipeline, ResourceType::Pipeline) {
            self.count("BindRayTracingPipeline");
        }
    }

    fn bind_descriptor_set(&mut self, _index: u32, set: Handle, _dynamic_offsets: &[u32]) {
        if self.expect(set, ResourceType::DescriptorSet) {
            self.count("BindDescriptorSet");
        }
    }

    fn push_constant(&mut self, _offset: u32, _stages: ShaderStages, _data: &[u8]) {
        self.count("PushConstant");
    }

    fn set_stack_size(&mut self, _bytes: u32) {
        self.count("SetStackSize");
    }

    fn trace_rays(&mut self, sbt: Handle, _dim: [u32; 3]) {
        if self.expect(sbt, ResourceType::Buffer) {
            self.count("TraceRays");
        }
    }

    fn trace_rays_indirect(&mut self, sbt: Handle, buffer: Handle, _offset: u64) {
        if self.expect(sbt, ResourceType::Buffer) && self.expect(buffer, ResourceType::Buffer) {
            self.count("TraceRaysIndirect");
        }
    }
}
