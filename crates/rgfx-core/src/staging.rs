//! Host-visible staging memory for uploads and readbacks.
//!
//! Two heaps. The static heap has one buffer per frame slot, queue and
//! direction, carved by a lock-free bump pointer that resets when its frame
//! slot comes round again. The dynamic heap hands out fixed-size blocks and
//! reuses a block once the last frame that wrote into it has retired.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use rgfx_protocol::types::{Extent3, PixelFormat};
use rgfx_protocol::{FrameId, QueueType};

use crate::config::GraphicsConfig;
use crate::error::GfxError;
use crate::handle::Handle;
use crate::scheduler::FrameListener;

fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value / alignment * alignment
    }
}

// ── Mapped memory ───────────────────────────────────────────────────────

/// CPU view of a staging buffer.
#[derive(Clone)]
pub struct MappedMemory {
    bytes: Arc<Mutex<Box<[u8]>>>,
}

impl MappedMemory {
    pub fn new(size: usize) -> Self {
        Self { bytes: Arc::new(Mutex::new(vec![0u8; size].into_boxed_slice())) }
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn span(&self, len: usize, offset: u64, count: usize) -> Result<std::ops::Range<usize>, GfxError> {
        let start = usize::try_from(offset)
            .map_err(|_| GfxError::validation("mapped offset overflows usize"))?;
        let end = start
            .checked_add(count)
            .filter(|end| *end <= len)
            .ok_or_else(|| {
                GfxError::validation(format!(
                    "mapped access {}..+{} outside {} bytes",
                    offset, count, len
                ))
            })?;
        Ok(start..end)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), GfxError> {
        let mut bytes = self.bytes.lock();
        let span = self.span(bytes.len(), offset, data.len())?;
        bytes[span].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), GfxError> {
        let bytes = self.bytes.lock();
        let span = self.span(bytes.len(), offset, out.len())?;
        out.copy_from_slice(&bytes[span]);
        Ok(())
    }

    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>, GfxError> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    /// True if both views alias the same allocation.
    pub fn same_memory(&self, other: &MappedMemory) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl std::fmt::Debug for MappedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedMemory").field("len", &self.len()).finish()
    }
}

// ── Backend seam ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingDirection {
    Upload,
    Readback,
}

impl StagingDirection {
    fn index(self) -> usize {
        match self {
            StagingDirection::Upload => 0,
            StagingDirection::Readback => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    Static,
    Dynamic,
    /// Static first, the remainder from the dynamic heap.
    Any,
}

#[derive(Debug, Clone)]
pub struct StagingBuffer {
    pub buffer: Handle,
    pub capacity: u64,
    pub mapped: MappedMemory,
}

/// Allocates host-visible buffers.
pub trait StagingMemory: Send + Sync {
    fn create_staging_buffer(
        &self,
        size: u64,
        direction: StagingDirection,
    ) -> Result<StagingBuffer, GfxError>;

    fn destroy_staging_buffer(&self, _buffer: Handle) {}
}

// ── Requests and ranges ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct StagingRequest {
    pub size: u64,
    /// Every range except the last is a multiple of this.
    pub block_size: u64,
    pub alignment: u64,
    pub frame: FrameId,
    pub heap: HeapKind,
    pub direction: StagingDirection,
    pub queue: QueueType,
}

impl StagingRequest {
    pub fn upload(size: u64, frame: FrameId) -> Self {
        Self {
            size,
            block_size: 1,
            alignment: 16,
            frame,
            heap: HeapKind::Any,
            direction: StagingDirection::Upload,
            queue: QueueType::Graphics,
        }
    }

    pub fn readback(size: u64, frame: FrameId) -> Self {
        Self { direction: StagingDirection::Readback, ..Self::upload(size, frame) }
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment.max(1);
        self
    }

    pub fn heap(mut self, heap: HeapKind) -> Self {
        self.heap = heap;
        self
    }

    pub fn queue(mut self, queue: QueueType) -> Self {
        self.queue = queue;
        self
    }
}

/// Slice of a staging buffer owned by one frame.
#[derive(Debug, Clone)]
pub struct StagingRange {
    pub buffer: Handle,
    pub offset: u64,
    pub size: u64,
    pub frame: FrameId,
    pub heap: HeapKind,
    pub mapped: MappedMemory,
}

impl StagingRange {
    /// Write at `at`, relative to the start of the range.
    pub fn write(&self, at: u64, data: &[u8]) -> Result<(), GfxError> {
        if at + data.len() as u64 > self.size {
            return Err(GfxError::validation(format!(
                "write of {} bytes at {} exceeds range of {}",
                data.len(),
                at,
                self.size
            )));
        }
        self.mapped.write(self.offset + at, data)
    }

    pub fn read(&self, at: u64, len: usize) -> Result<Vec<u8>, GfxError> {
        if at + len as u64 > self.size {
            return Err(GfxError::validation(format!(
                "read of {} bytes at {} exceeds range of {}",
                len, at, self.size
            )));
        }
        self.mapped.read_vec(self.offset + at, len)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingFrameStat {
    pub dynamic_read: u64,
    pub dynamic_write: u64,
    pub static_read: u64,
    pub static_write: u64,
}

// ── Image layout ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct ImageStagingDesc {
    pub format: PixelFormat,
    pub extent: Extent3,
    /// Caller's row pitch in bytes, zero when tightly packed.
    pub data_row_pitch: u64,
    pub data_slice_pitch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub row_pitch: u64,
    pub slice_pitch: u64,
    /// Rows of texel blocks per slice.
    pub block_rows: u32,
    pub depth: u32,
    pub total_size: u64,
}

impl ImageStagingDesc {
    pub fn layout(&self) -> ImageLayout {
        let info = self.format.info();
        let width_bits = u64::from(self.extent.width) * u64::from(info.bits_per_block);
        let packed_row = width_bits.div_ceil(u64::from(info.block_width) * 8);
        let row_pitch = self.data_row_pitch.max(packed_row);
        let block_rows = self.extent.height.div_ceil(info.block_height);
        let slice_pitch = self.data_slice_pitch.max(u64::from(block_rows) * row_pitch);
        let depth = self.extent.depth.max(1);
        let total_size = if depth > 1 { slice_pitch * u64::from(depth) } else { slice_pitch };
        ImageLayout { row_pitch, slice_pitch, block_rows, depth, total_size }
    }
}

/// One staging range and the part of the image it carries.
#[derive(Debug, Clone)]
pub struct ImageStagingRange {
    pub range: StagingRange,
    pub first_slice: u32,
    pub slice_count: u32,
    /// Block row within `first_slice`; zero for whole-slice ranges.
    pub first_row: u32,
    /// Block rows; equal to `block_rows` for whole-slice ranges.
    pub row_count: u32,
}

// ── Manager ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct StagingConfig {
    pub max_frames: u32,
    pub static_size: u64,
    pub dynamic_block_size: u64,
    pub max_dynamic_size: u64,
}

impl From<&GraphicsConfig> for StagingConfig {
    fn from(config: &GraphicsConfig) -> Self {
        Self {
            max_frames: config.max_frames,
            static_size: config.static_staging_size,
            dynamic_block_size: config.dynamic_block_size,
            max_dynamic_size: config.max_dynamic_size,
        }
    }
}

struct StaticBuffer {
    buffer: StagingBuffer,
    cursor: AtomicU64,
}

struct DynamicBlock {
    buffer: StagingBuffer,
    direction: StagingDirection,
    cursor: u64,
    current: bool,
    last_frame: u64,
}

#[derive(Default)]
struct DynamicHeap {
    blocks: Vec<DynamicBlock>,
    total: u64,
}

#[derive(Default)]
struct FrameCounters {
    dynamic_read: AtomicU64,
    dynamic_write: AtomicU64,
    static_read: AtomicU64,
    static_write: AtomicU64,
}

pub struct StagingBufferManager {
    memory: Arc<dyn StagingMemory>,
    config: StagingConfig,
    /// Indexed by `(frame slot, queue, direction)`.
    static_buffers: Box<[Mutex<Option<Arc<StaticBuffer>>>]>,
    dynamic: Mutex<DynamicHeap>,
    retired: AtomicU64,
    stats: FrameCounters,
}

impl StagingBufferManager {
    pub fn new(memory: Arc<dyn StagingMemory>, config: StagingConfig) -> Self {
        let max_frames = config.max_frames.clamp(1, FrameId::MAX_FRAMES_LIMIT) as usize;
        let slots = max_frames * QueueType::COUNT * 2;
        Self {
            memory,
            config: StagingConfig { max_frames: max_frames as u32, ..config },
            static_buffers: (0..slots).map(|_| Mutex::new(None)).collect(),
            dynamic: Mutex::new(DynamicHeap::default()),
            retired: AtomicU64::new(0),
            stats: FrameCounters::default(),
        }
    }

    pub fn config(&self) -> StagingConfig {
        self.config
    }

    fn static_slot(&self, frame: FrameId, queue: QueueType, direction: StagingDirection) -> usize {
        let frame_slot = (frame.unique() % u64::from(self.config.max_frames)) as usize;
        (frame_slot * QueueType::COUNT + queue.index()) * 2 + direction.index()
    }

    fn static_buffer(&self, req: &StagingRequest) -> Result<Option<Arc<StaticBuffer>>, GfxError> {
        if self.config.static_size == 0 {
            return Ok(None);
        }
        let mut slot = self.static_buffers[self.static_slot(req.frame, req.queue, req.direction)].lock();
        if let Some(buffer) = slot.as_ref() {
            return Ok(Some(Arc::clone(buffer)));
        }
        let buffer = self
            .memory
            .create_staging_buffer(self.config.static_size, req.direction)?;
        debug!(
            frame_slot = req.frame.index(),
            queue = ?req.queue,
            direction = ?req.direction,
            size = buffer.capacity,
            "static staging buffer created"
        );
        let buffer = Arc::new(StaticBuffer { buffer, cursor: AtomicU64::new(0) });
        *slot = Some(Arc::clone(&buffer));
        Ok(Some(buffer))
    }

    /// At most one range from the static heap, possibly shorter than `size`.
    fn alloc_static(&self, req: &StagingRequest, size: u64) -> Result<Option<StagingRange>, GfxError> {
        let Some(heap) = self.static_buffer(req)? else {
            return Ok(None);
        };
        let cap = heap.buffer.capacity;
        let block = req.block_size.min(size).max(1);

        let mut cursor = heap.cursor.load(Ordering::Acquire);
        loop {
            let offset = align_up(cursor, req.alignment);
            if offset + block > cap {
                return Ok(None);
            }
            let len = if size <= cap - offset { size } else { align_down(cap - offset, block) };
            match heap.cursor.compare_exchange_weak(
                cursor,
                offset + len,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(Some(StagingRange {
                        buffer: heap.buffer.buffer,
                        offset,
                        size: len,
                        frame: req.frame,
                        heap: HeapKind::Static,
                        mapped: heap.buffer.mapped.clone(),
                    }));
                }
                Err(actual) => cursor = actual,
            }
        }
    }

    fn alloc_dynamic(&self, req: &StagingRequest, mut remaining: u64) -> Result<Vec<StagingRange>, GfxError> {
        let retired = self.retired.load(Ordering::Acquire);
        let frame = req.frame.unique();
        let block_capacity = self.config.dynamic_block_size.max(align_up(req.block_size, req.alignment));
        let mut heap = self.dynamic.lock();
        let mut ranges = Vec::new();

        while remaining > 0 {
            let want = req.block_size.min(remaining).max(1);

            // Current block for this direction.
            let mut chosen = heap.blocks.iter().position(|b| {
                b.current
                    && b.direction == req.direction
                    && align_up(b.cursor, req.alignment) + want <= b.buffer.capacity
            });

            // A retired block.
            if chosen.is_none() {
                chosen = heap.blocks.iter().position(|b| {
                    !b.current
                        && b.direction == req.direction
                        && b.last_frame <= retired
                        && want <= b.buffer.capacity
                });
                if let Some(index) = chosen {
                    let block = &mut heap.blocks[index];
                    block.cursor = 0;
                    block.current = true;
                }
            }

            // A fresh block.
            if chosen.is_none() {
                if heap.total + block_capacity > self.config.max_dynamic_size {
                    warn!(
                        total = heap.total,
                        max = self.config.max_dynamic_size,
                        remaining,
                        "dynamic staging heap exhausted"
                    );
                    return Err(GfxError::ResourceExhausted(format!(
                        "dynamic staging heap full ({} of {} bytes)",
                        heap.total, self.config.max_dynamic_size
                    )));
                }
                let buffer = self.memory.create_staging_buffer(block_capacity, req.direction)?;
                heap.total += buffer.capacity;
                debug!(size = buffer.capacity, total = heap.total, direction = ?req.direction, "dynamic staging block created");
                heap.blocks.push(DynamicBlock {
                    buffer,
                    direction: req.direction,
                    cursor: 0,
                    current: true,
                    last_frame: frame,
                });
                chosen = Some(heap.blocks.len() - 1);
            }

            let Some(index) = chosen else {
                break;
            };

            // One current block per direction.
            for (i, block) in heap.blocks.iter_mut().enumerate() {
                if i != index && block.current && block.direction == req.direction {
                    block.current = false;
                }
            }

            let block = &mut heap.blocks[index];
            let offset = align_up(block.cursor, req.alignment);
            let avail = block.buffer.capacity - offset;
            let len = if remaining <= avail { remaining } else { align_down(avail, want) };
            block.cursor = offset + len;
            block.last_frame = block.last_frame.max(frame);
            if block.cursor >= block.buffer.capacity {
                block.current = false;
            }
            ranges.push(StagingRange {
                buffer: block.buffer.buffer,
                offset,
                size: len,
                frame: req.frame,
                heap: HeapKind::Dynamic,
                mapped: block.buffer.mapped.clone(),
            });
            remaining -= len;
        }
        Ok(ranges)
    }

    /// Carve `req.size` bytes into one or more ranges.
    pub fn get_buffer_ranges(&self, req: &StagingRequest) -> Result<Vec<StagingRange>, GfxError> {
        if req.size == 0 {
            return Ok(Vec::new());
        }
        let mut ranges = Vec::new();
        let mut remaining = req.size;

        if matches!(req.heap, HeapKind::Static | HeapKind::Any) {
            if let Some(range) = self.alloc_static(req, remaining)? {
                remaining -= range.size;
                self.count(HeapKind::Static, req.direction, range.size);
                ranges.push(range);
            }
        }
        if remaining > 0 && matches!(req.heap, HeapKind::Dynamic | HeapKind::Any) {
            let dynamic = self.alloc_dynamic(req, remaining)?;
            for range in &dynamic {
                self.count(HeapKind::Dynamic, req.direction, range.size);
            }
            remaining -= dynamic.iter().map(|r| r.size).sum::<u64>();
            ranges.extend(dynamic);
        }
        if remaining > 0 {
            return Err(GfxError::ResourceExhausted(format!(
                "static staging heap cannot hold {} more bytes",
                remaining
            )));
        }

        trace!(size = req.size, ranges = ranges.len(), frame = %req.frame, "staging ranges allocated");
        Ok(ranges)
    }

    /// Ranges for an image copy, split on whole slices when a slice fits a
    /// dynamic block, otherwise on whole block rows.
    pub fn get_image_ranges(
        &self,
        desc: &ImageStagingDesc,
        req: &StagingRequest,
    ) -> Result<Vec<ImageStagingRange>, GfxError> {
        let layout = desc.layout();
        if layout.total_size == 0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();

        if layout.depth > 1 && layout.slice_pitch <= self.config.dynamic_block_size {
            let ranges = self.get_buffer_ranges(&StagingRequest {
                size: layout.total_size,
                block_size: layout.slice_pitch,
                ..*req
            })?;
            let mut data_offset = 0u64;
            for range in ranges {
                let first_slice = (data_offset / layout.slice_pitch) as u32;
                let slice_count = range.size.div_ceil(layout.slice_pitch) as u32;
                data_offset += range.size;
                out.push(ImageStagingRange {
                    range,
                    first_slice,
                    slice_count,
                    first_row: 0,
                    row_count: layout.block_rows,
                });
            }
            return Ok(out);
        }

        for slice in 0..layout.depth {
            let ranges = self.get_buffer_ranges(&StagingRequest {
                size: layout.slice_pitch,
                block_size: layout.row_pitch,
                ..*req
            })?;
            let mut data_offset = 0u64;
            for range in ranges {
                let first_row = (data_offset / layout.row_pitch) as u32;
                let row_count = range
                    .size
                    .div_ceil(layout.row_pitch)
                    .min(u64::from(layout.block_rows.saturating_sub(first_row))) as u32;
                data_offset += range.size;
                out.push(ImageStagingRange {
                    range,
                    first_slice: slice,
                    slice_count: 1,
                    first_row,
                    row_count,
                });
            }
        }
        Ok(out)
    }

    fn count(&self, heap: HeapKind, direction: StagingDirection, bytes: u64) {
        let counter = match (heap, direction) {
            (HeapKind::Static, StagingDirection::Upload) => &self.stats.static_write,
            (HeapKind::Static, StagingDirection::Readback) => &self.stats.static_read,
            (_, StagingDirection::Upload) => &self.stats.dynamic_write,
            (_, StagingDirection::Readback) => &self.stats.dynamic_read,
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes handed out since the current frame began.
    pub fn frame_stat(&self) -> StagingFrameStat {
        StagingFrameStat {
            dynamic_read: self.stats.dynamic_read.load(Ordering::Relaxed),
            dynamic_write: self.stats.dynamic_write.load(Ordering::Relaxed),
            static_read: self.stats.static_read.load(Ordering::Relaxed),
            static_write: self.stats.static_write.load(Ordering::Relaxed),
        }
    }

    /// Total bytes held by the dynamic heap.
    pub fn dynamic_size(&self) -> u64 {
        self.dynamic.lock().total
    }
}

impl FrameListener for StagingBufferManager {
    fn on_begin_frame(&self, frame: FrameId) {
        for queue in QueueType::ALL {
            for direction in [StagingDirection::Upload, StagingDirection::Readback] {
                if let Some(buffer) = self.static_buffers[self.static_slot(frame, queue, direction)].lock().as_ref() {
                    buffer.cursor.store(0, Ordering::Release);
                }
            }
        }
        self.stats.dynamic_read.store(0, Ordering::Relaxed);
        self.stats.dynamic_write.store(0, Ordering::Relaxed);
        self.stats.static_read.store(0, Ordering::Relaxed);
        self.stats.static_write.store(0, Ordering::Relaxed);
    }

    fn on_frame_retired(&self, frame: FrameId) {
        self.retired.fetch_max(frame.unique(), Ordering::AcqRel);
    }
}

impl Drop for StagingBufferManager {
    fn drop(&mut self) {
        for slot in self.static_buffers.iter() {
            if let Some(buffer) = slot.lock().take() {
                self.memory.destroy_staging_buffer(buffer.buffer.buffer);
            }
        }
        for block in self.dynamic.lock().blocks.drain(..) {
            self.memory.destroy_staging_buffer(block.buffer.buffer);
        }
    }
}
