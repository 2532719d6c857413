//! Host-side device for one client session.
//!
//! A `HostDevice` owns the session's scheduler, staging heaps, resource
//! table and replay executor, all on top of one [`GpuBackend`]. Requests are
//! handled synchronously; the channel loop runs `dispatch` on a blocking
//! thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use rgfx_core::config::GraphicsConfig;
use rgfx_core::context::ContextFactory;
use rgfx_core::staging::{HeapKind, StagingConfig, StagingRequest};
use rgfx_core::{
    BatchId, CmdBatchDesc, GfxError, Handle, HandleValidator, RenderTaskScheduler, SchedulerConfig,
    SemaphoreDep, StagingBufferManager, SubmitBackend, SubmitMode,
};
use rgfx_protocol::messages::{
    BatchCreated, CmdBufBake, CmdBufBaked, DeviceInfo, FrameBegun, FrameEnded, FrameWaited,
    QueryResults, ResourceCreated, StagingGetRanges, StagingHeap, StagingRangeDesc, StagingRanges,
    StagingStat, SwapchainAcquired, SwapchainCreated,
};
use rgfx_protocol::{
    Frame, Message, ProtocolError, RemoteId, ResourceType, SemaphoreValue, CATALOG_VERSION,
};

use crate::backend::{DescriptorBinding, GpuBackend, ResourceBackend};
use crate::readback::{ReadbackQueue, LOG_WARN};
use crate::replay::{BakeRequest, ReplayExecutor};
use crate::resources::ResourceTable;

/// Longest a present waits for its semaphore.
const PRESENT_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest shutdown waits for submitted work before releasing resources.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames produced by one request: pushes first, then the response.
#[derive(Debug)]
pub struct Dispatched {
    pub pushes: Vec<Frame>,
    pub response: Frame,
    /// Outcome of a `CmdBufBake`, `None` for other requests.
    pub baked: Option<bool>,
}

pub struct HostDevice {
    backend: Arc<dyn GpuBackend>,
    scheduler: RenderTaskScheduler,
    staging: Arc<StagingBufferManager>,
    resources: Arc<ResourceTable>,
    readbacks: Arc<ReadbackQueue>,
    replay: ReplayExecutor,
    info: DeviceInfo,
    shut_down: AtomicBool,
}

impl HostDevice {
    pub fn new(backend: Arc<dyn GpuBackend>, config: &GraphicsConfig, host_name: &str) -> Self {
        let scheduler =
            RenderTaskScheduler::new(backend.clone().submitter(), SchedulerConfig::from(config));
        let staging = Arc::new(StagingBufferManager::new(
            backend.clone().staging_memory(),
            StagingConfig::from(config),
        ));
        let resources = Arc::new(ResourceTable::new(backend.clone()));
        let readbacks = Arc::new(ReadbackQueue::new());

        // Readbacks read staging before anything retired with the frame is
        // released or reused.
        scheduler.add_listener(readbacks.clone());
        scheduler.add_listener(resources.clone());
        scheduler.add_listener(staging.clone());

        let replay = ReplayExecutor::new(
            backend.clone().contexts(),
            backend.clone().validator(),
            staging.clone(),
        );

        let sched = scheduler.config();
        let info = DeviceInfo {
            device_name: backend.device_name(),
            host_name: host_name.to_string(),
            platform: rgfx_common::platform::platform_name().to_string(),
            max_frames: sched.max_frames,
            max_pending_batches: sched.max_pending_batches,
            supports_timeline: backend.supports_timeline(),
            upload_block_size: u32::try_from(config.upload_block_size).unwrap_or(u32::MAX),
            catalog_version: CATALOG_VERSION,
        };
        info!(device = %info.device_name, max_frames = info.max_frames, "host device created");

        Self {
            backend,
            scheduler,
            staging,
            resources,
            readbacks,
            replay,
            info,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    pub fn scheduler(&self) -> &RenderTaskScheduler {
        &self.scheduler
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Wait for outstanding work, deliver remaining readbacks and release
    /// every resource the client still holds. Returns the number of client
    /// resources released. Idempotent.
    pub fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        if self.scheduler.is_recording() {
            if let Err(e) = self.scheduler.end_frame() {
                warn!(error = %e, "could not close the open frame");
            }
        }
        match self.scheduler.wait_all(SHUTDOWN_TIMEOUT) {
            Ok(()) => self.readbacks.complete_all(),
            Err(e) => warn!(error = %e, "device did not go idle before shutdown"),
        }
        let released = self.resources.release_all();
        debug!(released, "host device shut down");
        released
    }

    /// Handle one device request.
    pub fn dispatch(&self, frame: Frame) -> Dispatched {
        let Frame { message, blob } = frame;
        let name = message.name();
        let mut baked = None;

        let result = if self.is_shut_down() {
            Err(ProtocolError::Validation("device has been shut down".into()))
        } else {
            self.handle(message, blob, &mut baked)
        };
        let response = match result {
            Ok(message) => Frame::new(message),
            Err(e) => {
                debug!(request = name, error = %e, "request failed");
                Frame::new(Message::error(e))
            }
        };
        Dispatched { pushes: self.readbacks.drain(), response, baked }
    }

    fn handle(
        &self,
        message: Message,
        blob: Vec<u8>,
        baked: &mut Option<bool>,
    ) -> Result<Message, ProtocolError> {
        Ok(match message {
            // ── Device ──────────────────────────────────────────────────
            Message::DeviceShutdown(_) => {
                let released = self.shutdown();
                if released > 0 {
                    info!(released, "client resources released at device shutdown");
                }
                Message::ok()
            }

            // ── Swapchain ───────────────────────────────────────────────
            Message::SwapchainCreate(req) => {
                let created =
                    self.backend.create_swapchain(req.width, req.height, req.format, req.image_count)?;
                self.resources.track(created.swapchain, "swapchain");
                SwapchainCreated {
                    swapchain: created.swapchain.into(),
                    images: created.images.into_iter().map(RemoteId::from).collect(),
                }
                .into()
            }
            Message::SwapchainAcquire(req) => {
                let swapchain = self.resolve(req.swapchain, ResourceType::Swapchain)?;
                let (image_index, image) = self.backend.acquire_image(swapchain)?;
                SwapchainAcquired { image_index, image: image.into() }.into()
            }
            Message::SwapchainPresent(req) => {
                let swapchain = self.resolve(req.swapchain, ResourceType::Swapchain)?;
                if let Some(wait) = req.wait {
                    if !self.backend.wait(&[semaphore_dep(wait)], PRESENT_TIMEOUT) {
                        return Err(GfxError::Timeout(PRESENT_TIMEOUT).into());
                    }
                }
                self.backend.present(swapchain, req.image_index)?;
                Message::ok()
            }

            // ── Frames and batches ──────────────────────────────────────
            Message::BeginFrame(_) => FrameBegun { frame: self.scheduler.begin_frame()? }.into(),
            Message::EndFrame(_) => {
                let completion = self.scheduler.end_frame()?;
                FrameEnded {
                    frame: completion.frame,
                    signals: completion.deps().into_iter().map(semaphore_value).collect(),
                }
                .into()
            }
            Message::WaitNextFrame(req) => {
                match self.scheduler.wait_next_frame(Duration::from_millis(req.timeout_ms)) {
                    Ok(retired) => FrameWaited { ok: true, retired },
                    Err(GfxError::Timeout(_)) => FrameWaited { ok: false, retired: None },
                    Err(e) => return Err(e.into()),
                }
                .into()
            }
            Message::WaitAll(req) => {
                self.scheduler.wait_all(Duration::from_millis(req.timeout_ms))?;
                self.readbacks.complete_all();
                Message::ok()
            }
            Message::CreateBatch(req) => {
                let mut desc = CmdBatchDesc::new(req.queue).label(req.label);
                for dep in req.input_deps {
                    desc = desc.wait_on(semaphore_dep(dep));
                }
                let id = self.scheduler.begin_cmd_batch(desc)?;
                let completion = self.scheduler.batch_semaphore(id)?;
                BatchCreated { batch: batch_remote(id), completion: semaphore_value(completion) }.into()
            }
            Message::SubmitBatch(req) => {
                let id = batch_id(req.batch)?;
                let mode = if req.immediately { SubmitMode::Immediately } else { SubmitMode::Deferred };
                self.scheduler.end_recording_and_submit(id, mode)?;
                Message::ok()
            }
            Message::WaitBatch(req) => {
                let id = batch_id(req.batch)?;
                let done = self.scheduler.wait_batch(id, Duration::from_millis(req.timeout_ms));
                if done {
                    self.readbacks.complete_batch(id);
                    Message::ok()
                } else {
                    Message::failed()
                }
            }
            Message::SkipBatch(req) => {
                let id = batch_id(req.batch)?;
                self.scheduler.skip_cmd_batch(id)?;
                self.readbacks.cancel_batch(id);
                Message::ok()
            }

            // ── Resources ───────────────────────────────────────────────
            Message::CreateBuffer(req) => {
                self.created(self.backend.create_buffer(&req.desc), &req.label).into()
            }
            Message::CreateImage(req) => {
                self.created(self.backend.create_image(&req.desc), &req.label).into()
            }
            Message::LoadPipeline(req) => {
                self.created(self.backend.load_pipeline(&req.name), &req.name).into()
            }
            Message::CreateSemaphore(req) => self
                .created(self.backend.create_timeline_semaphore(req.initial_value), "semaphore")
                .into(),
            Message::CreateDescriptorSet(req) => {
                let created = self
                    .resolve(req.pipeline, ResourceType::Pipeline)
                    .and_then(|pipeline| self.backend.create_descriptor_set(pipeline, req.set_index));
                self.created(created, "descriptor set").into()
            }
            Message::CreateQueryPool(req) => self
                .created(self.backend.create_query_pool(req.kind, req.count), "query pool")
                .into(),
            Message::ReleaseResource(req) => {
                if self.resources.release(Handle::from(req.id)) {
                    Message::ok()
                } else {
                    Message::failed()
                }
            }
            Message::DescribeResource(req) => self.resources.describe(Handle::from(req.id)).into(),

            // ── Queries and descriptors ─────────────────────────────────
            Message::ReadQueries(req) => {
                let pool = self.resolve(req.pool, ResourceType::QueryPool)?;
                QueryResults { values: self.backend.read_queries(pool, req.first, req.count)? }.into()
            }
            Message::DescriptorUpdateFlush(req) => {
                let set = self.resolve(req.set, ResourceType::DescriptorSet)?;
                let writes: Vec<DescriptorBinding> = req
                    .writes
                    .iter()
                    .map(|w| DescriptorBinding {
                        binding: w.binding,
                        element: w.element,
                        resource: Handle::from(w.resource),
                        offset: w.offset,
                        size: w.size,
                    })
                    .collect();
                self.backend.update_descriptor_set(set, &writes)?;
                Message::ok()
            }

            // ── Command buffers and staging ─────────────────────────────
            Message::CmdBufBake(bake) => {
                let (message, ok) = self.bake(&bake, &blob)?;
                *baked = Some(ok);
                message
            }
            Message::UploadData(req) => {
                let buffer = self.resolve(req.buffer, ResourceType::Buffer)?;
                self.backend.write_buffer(buffer, req.offset, &blob)?;
                Message::ok()
            }
            Message::StagingGetRanges(req) => self.staging_ranges(&req)?.into(),
            Message::StagingFrameStat(_) => {
                let stat = self.staging.frame_stat();
                StagingStat {
                    dynamic_write: stat.dynamic_write,
                    dynamic_read: stat.dynamic_read,
                    static_write: stat.static_write,
                    static_read: stat.static_read,
                }
                .into()
            }

            other => return Err(ProtocolError::UnsupportedMessage(other.type_id().0)),
        })
    }

    /// Replay a baked stream into the batch. A replay failure answers with
    /// an invalid id and a warning log push; the batch is left as it was.
    fn bake(&self, bake: &CmdBufBake, blob: &[u8]) -> Result<(Message, bool), ProtocolError> {
        let id = batch_id(bake.batch)?;
        let (queue, frame) = self.scheduler.recording_batch(id)?;
        let label = format!("{}#{}", id, bake.exe_index);
        let request = BakeRequest { bake, blob, queue, frame, label: &label };

        let result = self.replay.bake(&request).and_then(|baked| {
            match self.scheduler.commit_cmd_buffer_at(id, bake.exe_index, baked.cmdbuf) {
                Ok(()) => Ok(baked),
                Err(e) => {
                    self.backend.discard_command_buffer(baked.cmdbuf);
                    Err(e)
                }
            }
        });

        match result {
            Ok(baked) => {
                self.resources.hold_cmdbuf(frame, baked.cmdbuf);
                self.readbacks.add(id, baked.readbacks);
                Ok((CmdBufBaked { cmdbuf: baked.cmdbuf.into() }.into(), true))
            }
            Err(e) => {
                warn!(batch = %id, exe_index = bake.exe_index, error = %e, "bake failed");
                self.readbacks.log(LOG_WARN, "rgfx::bake", format!("bake of {} failed: {}", label, e));
                Ok((CmdBufBaked { cmdbuf: RemoteId::invalid() }.into(), false))
            }
        }
    }

    fn staging_ranges(&self, req: &StagingGetRanges) -> Result<StagingRanges, GfxError> {
        let frame = self.scheduler.current_frame();
        let heap = match req.heap {
            StagingHeap::Static => HeapKind::Static,
            StagingHeap::Dynamic => HeapKind::Dynamic,
            StagingHeap::Any => HeapKind::Any,
        };
        let request = if req.upload {
            StagingRequest::upload(req.size, frame)
        } else {
            StagingRequest::readback(req.size, frame)
        }
        .block_size(req.block_size)
        .alignment(req.alignment)
        .heap(heap)
        .queue(req.queue);

        let ranges = self
            .staging
            .get_buffer_ranges(&request)?
            .into_iter()
            .map(|r| StagingRangeDesc { buffer: r.buffer.into(), offset: r.offset, size: r.size })
            .collect();
        Ok(StagingRanges { frame, ranges })
    }

    fn created(&self, result: Result<Handle, GfxError>, label: &str) -> ResourceCreated {
        match result {
            Ok(handle) => {
                self.resources.track(handle, label);
                ResourceCreated { id: handle.into() }
            }
            Err(e) => {
                debug!(label, error = %e, "resource creation failed");
                ResourceCreated { id: RemoteId::invalid() }
            }
        }
    }

    fn resolve(&self, id: RemoteId, kind: ResourceType) -> Result<Handle, GfxError> {
        let handle = Handle::from(id);
        if id.resource_type != kind {
            return Err(GfxError::validation(format!("{} is not a {:?}", id, kind)));
        }
        if !self.backend.is_alive(handle) {
            return Err(GfxError::StaleHandle(handle));
        }
        Ok(handle)
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn batch_remote(id: BatchId) -> RemoteId {
    RemoteId::new(id.index(), id.generation(), ResourceType::CommandBatch)
}

fn batch_id(id: RemoteId) -> Result<BatchId, GfxError> {
    if id.resource_type != ResourceType::CommandBatch || !id.is_valid() {
        return Err(GfxError::validation(format!("{} is not a command batch", id)));
    }
    Ok(BatchId::from_bits((u64::from(id.generation) << 32) | u64::from(id.index)))
}

fn semaphore_dep(value: SemaphoreValue) -> SemaphoreDep {
    SemaphoreDep::new(Handle::from(value.semaphore), value.value)
}

fn semaphore_value(dep: SemaphoreDep) -> SemaphoreValue {
    SemaphoreValue { semaphore: dep.semaphore.into(), value: dep.value }
}
