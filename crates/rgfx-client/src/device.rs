use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use rgfx_core::config::{GraphicsConfig, RgfxConfig};
use rgfx_core::{GfxError, Handle, HandleMap, HandleRegistry};
use rgfx_protocol::messages::{
    BatchCreated, BeginFrame, CmdBufBaked, CreateBatch, CreateBuffer, CreateDescriptorSet,
    CreateImage, CreateQueryPool, CreateSemaphore, DefaultResponse, DescribeResource,
    DescriptorUpdateFlush, DescriptorWrite, DeviceInfo, DeviceInit, DeviceShutdown, EndFrame,
    FrameBegun, FrameEnded, FrameWaited, LoadPipeline, MessageKind, MetricsData, Ping, Pong,
    QueryMetrics, QueryResults, ReadQueries, ReleaseResource, ResourceCreated,
    ResourceDescription, SkipBatch, StagingFrameStat, StagingGetRanges, StagingRanges,
    StagingStat, SubmitBatch, SwapchainAcquire, SwapchainAcquired, SwapchainCreate,
    SwapchainCreated, SwapchainPresent, UploadData, WaitAll, WaitBatch, WaitNextFrame,
};
use rgfx_protocol::types::{BufferDesc, ImageDesc, PixelFormat, QueryKind};
use rgfx_protocol::{
    Frame, FrameId, Message, QueueType, RemoteId, SemaphoreValue, CATALOG_VERSION,
};
use rgfx_transport::{Connection, ConnectionOptions, TransportError};

use crate::capture::CaptureRecorder;
use crate::error::ClientError;
use crate::readback::ReadbackRegistry;

/// A batch opened on the host. Streams baked into it take consecutive
/// execution indices.
#[derive(Debug, Clone)]
pub struct RemoteBatch {
    pub id: RemoteId,
    pub queue: QueueType,
    /// Signalled when the batch completes; pass it as another batch's input
    /// dependency to order work across queues.
    pub completion: SemaphoreValue,
    next_exe: u32,
}

impl RemoteBatch {
    /// Execution index the next bake will use.
    pub fn next_exe_index(&self) -> u32 {
        self.next_exe
    }
}

#[derive(Debug, Clone)]
pub struct Swapchain {
    pub handle: Handle,
    pub images: Vec<Handle>,
}

/// One descriptor write, naming the bound resource by local handle.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorUpdate {
    pub binding: u32,
    pub element: u32,
    pub resource: Handle,
    pub offset: u64,
    pub size: u64,
}

/// Client view of a device living on a remote host.
///
/// Resources are named by local handles minted here and mapped to host ids;
/// the same map translates every captured record. Local slots are recycled
/// once the frame they were released in retires.
pub struct RemoteDevice {
    conn: Connection,
    info: DeviceInfo,
    handles: HandleRegistry<RemoteId>,
    map: Arc<HandleMap>,
    readbacks: Arc<ReadbackRegistry>,
    tokens: Arc<AtomicU64>,
    block_size: usize,
}

impl RemoteDevice {
    /// Connect to `config.client.address` and initialize the host device.
    pub async fn connect(config: &RgfxConfig, app_name: &str) -> Result<Self, ClientError> {
        let readbacks = Arc::new(ReadbackRegistry::new());
        let conn = Connection::connect(
            &config.client.address,
            ConnectionOptions::from(&config.client),
            readbacks.clone(),
        )
        .await?;
        Self::with_connection(conn, readbacks, &config.graphics, app_name).await
    }

    /// Initialize the device over an established connection. `readbacks`
    /// must be the connection's push handler.
    pub async fn with_connection(
        conn: Connection,
        readbacks: Arc<ReadbackRegistry>,
        graphics: &GraphicsConfig,
        app_name: &str,
    ) -> Result<Self, ClientError> {
        let info: DeviceInfo = conn.call(DeviceInit::new(app_name)).await?;
        if info.catalog_version != CATALOG_VERSION {
            return Err(ClientError::CatalogMismatch {
                host: info.catalog_version,
                client: CATALOG_VERSION,
            });
        }

        let block_size = match info.upload_block_size {
            0 => graphics.upload_block_size,
            host => u64::from(host).min(graphics.upload_block_size.max(1)),
        };
        info!(
            session_id = conn.session_id(),
            device = %info.device_name,
            host = %info.host_name,
            block_size,
            "remote device ready"
        );

        Ok(Self {
            conn,
            info,
            handles: HandleRegistry::new("client", graphics.handle_capacity),
            map: Arc::new(HandleMap::new()),
            readbacks,
            tokens: Arc::new(AtomicU64::new(1)),
            block_size: usize::try_from(block_size).unwrap_or(usize::MAX),
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn is_lost(&self) -> bool {
        self.conn.is_lost()
    }

    pub fn lost_signal(&self) -> watch::Receiver<bool> {
        self.conn.lost_signal()
    }

    /// Host id behind a local handle.
    pub fn remote_id(&self, handle: Handle) -> Option<RemoteId> {
        self.map.to_remote(handle)
    }

    pub fn live_handles(&self) -> usize {
        self.handles.live_count()
    }

    // ── Requests ────────────────────────────────────────────────────────

    async fn call<T>(&self, msg: impl Into<Message>) -> Result<T, ClientError>
    where
        T: MessageKind + TryFrom<Message, Error = Message>,
    {
        self.call_frame(Frame::new(msg)).await
    }

    async fn call_frame<T>(&self, frame: Frame) -> Result<T, ClientError>
    where
        T: MessageKind + TryFrom<Message, Error = Message>,
    {
        let result = self.conn.call_frame(frame).await;
        self.checked(result)
    }

    fn checked<T>(&self, result: Result<T, TransportError>) -> Result<T, ClientError> {
        result.map_err(|e| {
            let err = ClientError::from(e);
            if err.is_connection_lost() {
                self.readbacks.fail_all();
                let dropped = self.forget_remote_objects();
                if dropped > 0 {
                    warn!(session_id = self.conn.session_id(), dropped, "handles dropped with the connection");
                }
            }
            err
        })
    }

    /// The host destroys a session's objects when it ends. Unmap and release
    /// every local handle so later lookups fail instead of naming dead ids.
    fn forget_remote_objects(&self) -> usize {
        let pairs = self.map.drain();
        for (local, _) in &pairs {
            self.handles.release(*local);
        }
        self.handles.retire_all();
        pairs.len()
    }

    fn timeout_ms(timeout: Duration) -> u64 {
        u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
    }

    async fn expect_ok(&self, msg: impl Into<Message>, what: &str) -> Result<(), ClientError> {
        let reply: DefaultResponse = self.call(msg).await?;
        if reply.ok {
            Ok(())
        } else {
            Err(GfxError::validation(format!("host refused {}", what)).into())
        }
    }

    fn remote(&self, handle: Handle) -> Result<RemoteId, ClientError> {
        self.map.to_remote(handle).ok_or(ClientError::UnknownHandle(handle))
    }

    /// Map a freshly created host resource to a new local handle. A failed
    /// creation, or a full local registry, yields the invalid handle.
    async fn adopt(&self, created: ResourceCreated, what: &str) -> Result<Handle, ClientError> {
        if !created.id.is_valid() {
            warn!(resource = what, "host failed to create resource");
            return Ok(Handle::invalid());
        }
        let local = self.handles.allocate(created.id.resource_type, created.id);
        if !local.is_valid() {
            warn!(resource = what, "local handle registry full, releasing host resource");
            let _: DefaultResponse = self.call(ReleaseResource { id: created.id }).await?;
            return Ok(Handle::invalid());
        }
        self.map.insert(local, created.id);
        debug!(%local, remote = %created.id, resource = what, "resource created");
        Ok(local)
    }

    // ── Resources ───────────────────────────────────────────────────────

    pub async fn create_buffer(&self, desc: BufferDesc, label: &str) -> Result<Handle, ClientError> {
        let created = self.call(CreateBuffer { desc, label: label.into() }).await?;
        self.adopt(created, "buffer").await
    }

    pub async fn create_image(&self, desc: ImageDesc, label: &str) -> Result<Handle, ClientError> {
        let created = self.call(CreateImage { desc, label: label.into() }).await?;
        self.adopt(created, "image").await
    }

    pub async fn load_pipeline(&self, name: &str) -> Result<Handle, ClientError> {
        let created = self.call(LoadPipeline { name: name.into() }).await?;
        self.adopt(created, "pipeline").await
    }

    pub async fn create_semaphore(&self, initial_value: u64) -> Result<Handle, ClientError> {
        let created = self.call(CreateSemaphore { initial_value }).await?;
        self.adopt(created, "semaphore").await
    }

    pub async fn create_descriptor_set(
        &self,
        pipeline: Handle,
        set_index: u32,
    ) -> Result<Handle, ClientError> {
        let pipeline = self.remote(pipeline)?;
        let created = self.call(CreateDescriptorSet { pipeline, set_index }).await?;
        self.adopt(created, "descriptor set").await
    }

    pub async fn create_query_pool(&self, kind: QueryKind, count: u32) -> Result<Handle, ClientError> {
        let created = self.call(CreateQueryPool { kind, count }).await?;
        self.adopt(created, "query pool").await
    }

    /// Drop the resource on the host. The local handle goes stale at once;
    /// its slot is reused after the current frame retires.
    pub async fn release(&self, handle: Handle) -> Result<bool, ClientError> {
        let id = self.map.remove_by_local(handle).ok_or(ClientError::UnknownHandle(handle))?;
        self.handles.release(handle);
        let reply: DefaultResponse = self.call(ReleaseResource { id }).await?;
        if !reply.ok {
            warn!(%handle, remote = %id, "host did not know the released resource");
        }
        Ok(reply.ok)
    }

    pub async fn describe(&self, handle: Handle) -> Result<ResourceDescription, ClientError> {
        let id = self.remote(handle)?;
        self.call(DescribeResource { id }).await
    }

    /// Write `data` into a buffer immediately, outside any batch.
    pub async fn write_buffer(&self, buffer: Handle, offset: u64, data: Vec<u8>) -> Result<(), ClientError> {
        let buffer = self.remote(buffer)?;
        let reply: DefaultResponse =
            self.call_frame(Frame::with_blob(UploadData { buffer, offset }, data)).await?;
        if reply.ok {
            Ok(())
        } else {
            Err(GfxError::validation("host refused buffer upload").into())
        }
    }

    pub async fn read_queries(&self, pool: Handle, first: u32, count: u32) -> Result<Vec<u64>, ClientError> {
        let pool = self.remote(pool)?;
        let results: QueryResults = self.call(ReadQueries { pool, first, count }).await?;
        Ok(results.values)
    }

    pub async fn update_descriptors(
        &self,
        set: Handle,
        updates: &[DescriptorUpdate],
    ) -> Result<(), ClientError> {
        let set = self.remote(set)?;
        let writes = updates
            .iter()
            .map(|u| {
                Ok(DescriptorWrite {
                    binding: u.binding,
                    element: u.element,
                    resource: self.remote(u.resource)?,
                    offset: u.offset,
                    size: u.size,
                })
            })
            .collect::<Result<Vec<_>, ClientError>>()?;
        self.expect_ok(DescriptorUpdateFlush { set, writes }, "descriptor update").await
    }

    // ── Swapchain ───────────────────────────────────────────────────────

    pub async fn create_swapchain(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        image_count: u32,
    ) -> Result<Swapchain, ClientError> {
        let created: SwapchainCreated =
            self.call(SwapchainCreate { width, height, format, image_count }).await?;
        let handle = self.adopt(ResourceCreated { id: created.swapchain }, "swapchain").await?;
        let mut images = Vec::with_capacity(created.images.len());
        for id in created.images {
            images.push(self.adopt(ResourceCreated { id }, "swapchain image").await?);
        }
        Ok(Swapchain { handle, images })
    }

    /// Next presentable image: its index and local handle.
    pub async fn acquire_image(&self, swapchain: &Swapchain) -> Result<(u32, Handle), ClientError> {
        let id = self.remote(swapchain.handle)?;
        let acquired: SwapchainAcquired = self.call(SwapchainAcquire { swapchain: id }).await?;
        let image = swapchain
            .images
            .get(acquired.image_index as usize)
            .copied()
            .ok_or_else(|| {
                GfxError::Protocol(format!("host acquired unknown image {}", acquired.image_index))
            })?;
        Ok((acquired.image_index, image))
    }

    pub async fn present(
        &self,
        swapchain: &Swapchain,
        image_index: u32,
        wait: Option<SemaphoreValue>,
    ) -> Result<(), ClientError> {
        let id = self.remote(swapchain.handle)?;
        self.expect_ok(SwapchainPresent { swapchain: id, image_index, wait }, "present").await
    }

    // ── Frames and batches ──────────────────────────────────────────────

    pub async fn begin_frame(&self) -> Result<FrameId, ClientError> {
        let begun: FrameBegun = self.call(BeginFrame).await?;
        self.handles.set_current_frame(begun.frame);
        debug!(frame = %begun.frame, "frame begun");
        Ok(begun.frame)
    }

    /// Close the recording frame. Returns the semaphore values that signal
    /// its completion.
    pub async fn end_frame(&self) -> Result<FrameEnded, ClientError> {
        self.call(EndFrame).await
    }

    /// Retire at most one in-flight frame.
    pub async fn wait_next_frame(&self, timeout: Duration) -> Result<Option<FrameId>, ClientError> {
        let waited: FrameWaited =
            self.call(WaitNextFrame { timeout_ms: Self::timeout_ms(timeout) }).await?;
        if !waited.ok {
            return Err(GfxError::Timeout(timeout).into());
        }
        if let Some(frame) = waited.retired {
            let recycled = self.handles.retire(frame);
            debug!(%frame, recycled = recycled.len(), "frame retired");
        }
        Ok(waited.retired)
    }

    /// Flush and wait for everything submitted. Pending readbacks arrive
    /// ahead of the response.
    pub async fn wait_all(&self, timeout: Duration) -> Result<(), ClientError> {
        self.expect_ok(WaitAll { timeout_ms: Self::timeout_ms(timeout) }, "wait all").await?;
        self.handles.retire_all();
        Ok(())
    }

    pub async fn create_batch(
        &self,
        queue: QueueType,
        label: &str,
        input_deps: Vec<SemaphoreValue>,
    ) -> Result<RemoteBatch, ClientError> {
        let created: BatchCreated =
            self.call(CreateBatch { queue, label: label.into(), input_deps }).await?;
        Ok(RemoteBatch { id: created.batch, queue, completion: created.completion, next_exe: 0 })
    }

    pub async fn submit_batch(&self, batch: &RemoteBatch, immediately: bool) -> Result<(), ClientError> {
        self.expect_ok(SubmitBatch { batch: batch.id, immediately }, "batch submit").await
    }

    /// Returns false if the batch has not completed within `timeout`.
    pub async fn wait_batch(&self, batch: &RemoteBatch, timeout: Duration) -> Result<bool, ClientError> {
        let reply: DefaultResponse = self
            .call(WaitBatch { batch: batch.id, timeout_ms: Self::timeout_ms(timeout) })
            .await?;
        Ok(reply.ok)
    }

    /// Discard a batch that was never submitted.
    pub async fn skip_batch(&self, batch: RemoteBatch) -> Result<(), ClientError> {
        self.expect_ok(SkipBatch { batch: batch.id }, "batch skip").await
    }

    // ── Capture ─────────────────────────────────────────────────────────

    /// Start capturing a command stream against this device's handles.
    pub fn recorder(&self) -> CaptureRecorder {
        CaptureRecorder::new(self.map.clone(), self.block_size, self.tokens.clone())
    }

    /// Bake a captured stream into the batch at its next execution index.
    pub async fn bake(
        &self,
        batch: &mut RemoteBatch,
        recorder: CaptureRecorder,
    ) -> Result<RemoteId, ClientError> {
        let stream = recorder.into_stream()?;
        let exe_index = batch.next_exe;
        let records = stream.record_count;
        let baked: CmdBufBaked = self.call_frame(stream.into_frame(batch.id, exe_index)).await?;
        if !baked.cmdbuf.is_valid() {
            return Err(ClientError::BakeRejected { batch: batch.id, exe_index });
        }
        batch.next_exe += 1;
        debug!(batch = %batch.id, exe_index, records, cmdbuf = %baked.cmdbuf, "stream baked");
        Ok(baked.cmdbuf)
    }

    /// Data read back under `token`.
    pub async fn readback(&self, token: u64, timeout: Duration) -> Result<Vec<u8>, ClientError> {
        self.readbacks.wait(token, timeout).await
    }

    // ── Staging and diagnostics ─────────────────────────────────────────

    pub async fn staging_ranges(&self, request: StagingGetRanges) -> Result<StagingRanges, ClientError> {
        self.call(request).await
    }

    pub async fn staging_stat(&self) -> Result<StagingStat, ClientError> {
        self.call(StagingFrameStat).await
    }

    pub async fn metrics(&self) -> Result<MetricsData, ClientError> {
        self.call(QueryMetrics).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        let _: Pong = self.call(Ping).await?;
        Ok(())
    }

    /// Tear the host device down. Every handle this device minted goes stale.
    pub async fn shutdown(self) -> Result<(), ClientError> {
        self.expect_ok(DeviceShutdown, "device shutdown").await?;
        let released = self.forget_remote_objects();
        info!(session_id = self.conn.session_id(), released, "remote device shut down");
        Ok(())
    }
}
