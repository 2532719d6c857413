//! Barrier accumulation.
//!
//! Barriers are appended in call order and flushed as one sink call. Merging
//! never reorders or deduplicates: the merged-in set lands ahead of the
//! receiver's own entries.

use std::sync::Arc;

use tracing::{trace, warn};

use rgfx_protocol::types::{ImageSubresourceRange, PipelineStages, ResourceState};
use rgfx_protocol::QueueType;

use crate::error::GfxError;
use crate::handle::Handle;
use crate::registry::HandleValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRange {
    pub offset: u64,
    pub size: u64,
}

/// Queue family ownership transfer attached to a buffer or image barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTransfer {
    Acquire { from: QueueType },
    Release { to: QueueType },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Barrier {
    Buffer {
        buffer: Handle,
        range: Option<BufferRange>,
        src: ResourceState,
        dst: ResourceState,
        transfer: Option<QueueTransfer>,
    },
    Image {
        image: Handle,
        range: Option<ImageSubresourceRange>,
        src: ResourceState,
        dst: ResourceState,
        transfer: Option<QueueTransfer>,
    },
    Memory {
        src: ResourceState,
        dst: ResourceState,
    },
    Execution {
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
    },
}

impl Barrier {
    /// Resource named by the barrier, if any.
    pub fn resource(&self) -> Option<Handle> {
        match self {
            Barrier::Buffer { buffer, .. } => Some(*buffer),
            Barrier::Image { image, .. } => Some(*image),
            Barrier::Memory { .. } | Barrier::Execution { .. } => None,
        }
    }
}

/// Receives one flush of accumulated barriers, e.g. a native context.
pub trait BarrierSink {
    fn commit_barriers(&mut self, barriers: &[Barrier]);
}

/// Per-kind append operations, shared by every barrier accumulator.
pub trait BarrierRecorder {
    fn push_barrier(&mut self, barrier: Barrier);

    fn buffer_barrier(&mut self, buffer: Handle, src: ResourceState, dst: ResourceState) {
        self.push_barrier(Barrier::Buffer { buffer, range: None, src, dst, transfer: None });
    }

    fn buffer_range_barrier(
        &mut self,
        buffer: Handle,
        offset: u64,
        size: u64,
        src: ResourceState,
        dst: ResourceState,
    ) {
        self.push_barrier(Barrier::Buffer {
            buffer,
            range: Some(BufferRange { offset, size }),
            src,
            dst,
            transfer: None,
        });
    }

    fn image_barrier(&mut self, image: Handle, src: ResourceState, dst: ResourceState) {
        self.push_barrier(Barrier::Image { image, range: None, src, dst, transfer: None });
    }

    fn image_range_barrier(
        &mut self,
        image: Handle,
        range: ImageSubresourceRange,
        src: ResourceState,
        dst: ResourceState,
    ) {
        self.push_barrier(Barrier::Image { image, range: Some(range), src, dst, transfer: None });
    }

    fn memory_barrier(&mut self, src: ResourceState, dst: ResourceState) {
        self.push_barrier(Barrier::Memory { src, dst });
    }

    fn execution_barrier(&mut self, src_stages: PipelineStages, dst_stages: PipelineStages) {
        self.push_barrier(Barrier::Execution { src_stages, dst_stages });
    }

    fn acquire_buffer_ownership(
        &mut self,
        buffer: Handle,
        from: QueueType,
        src: ResourceState,
        dst: ResourceState,
    ) {
        self.push_barrier(Barrier::Buffer {
            buffer,
            range: None,
            src,
            dst,
            transfer: Some(QueueTransfer::Acquire { from }),
        });
    }

    fn release_buffer_ownership(
        &mut self,
        buffer: Handle,
        to: QueueType,
        src: ResourceState,
        dst: ResourceState,
    ) {
        self.push_barrier(Barrier::Buffer {
            buffer,
            range: None,
            src,
            dst,
            transfer: Some(QueueTransfer::Release { to }),
        });
    }

    fn acquire_image_ownership(
        &mut self,
        image: Handle,
        from: QueueType,
        src: ResourceState,
        dst: ResourceState,
    ) {
        self.push_barrier(Barrier::Image {
            image,
            range: None,
            src,
            dst,
            transfer: Some(QueueTransfer::Acquire { from }),
        });
    }

    fn release_image_ownership(
        &mut self,
        image: Handle,
        to: QueueType,
        src: ResourceState,
        dst: ResourceState,
    ) {
        self.push_barrier(Barrier::Image {
            image,
            range: None,
            src,
            dst,
            transfer: Some(QueueTransfer::Release { to }),
        });
    }
}

fn flush<S: BarrierSink + ?Sized>(
    barriers: &mut Vec<Barrier>,
    validator: Option<&dyn HandleValidator>,
    sink: &mut S,
) -> Result<(), GfxError> {
    if barriers.is_empty() {
        return Ok(());
    }
    if cfg!(debug_assertions) {
        if let Some(validator) = validator {
            if let Some(dead) = barriers
                .iter()
                .filter_map(Barrier::resource)
                .find(|h| !validator.is_alive(*h))
            {
                return Err(GfxError::StaleHandle(dead));
            }
        }
    }
    trace!(count = barriers.len(), "committing barriers");
    sink.commit_barriers(barriers);
    barriers.clear();
    Ok(())
}

fn prepend(dst: &mut Vec<Barrier>, src: &mut Vec<Barrier>) {
    if src.is_empty() {
        return;
    }
    src.append(dst);
    std::mem::swap(dst, src);
}

/// Barriers collected before a recording context exists, e.g. on another
/// thread. Combine with `merge`, flush with `commit_barriers`.
#[derive(Debug, Default, Clone)]
pub struct DeferredBarrierSet {
    barriers: Vec<Barrier>,
}

impl DeferredBarrierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_pending_barriers(&self) -> bool {
        self.barriers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    pub fn barriers(&self) -> &[Barrier] {
        &self.barriers
    }

    /// Move `other`'s barriers in front of ours and leave `other` empty.
    pub fn merge(&mut self, other: &mut DeferredBarrierSet) {
        prepend(&mut self.barriers, &mut other.barriers);
    }

    pub fn commit_barriers<S: BarrierSink + ?Sized>(&mut self, sink: &mut S) -> Result<(), GfxError> {
        flush(&mut self.barriers, None, sink)
    }

    pub fn clear(&mut self) {
        self.barriers.clear();
    }
}

impl BarrierRecorder for DeferredBarrierSet {
    fn push_barrier(&mut self, barrier: Barrier) {
        self.barriers.push(barrier);
    }
}

/// Barrier accumulator owned by one recording context.
#[derive(Default)]
pub struct BarrierManager {
    barriers: Vec<Barrier>,
    validator: Option<Arc<dyn HandleValidator>>,
}

impl BarrierManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check handle liveness at commit time (debug builds only).
    pub fn with_validator(validator: Arc<dyn HandleValidator>) -> Self {
        Self { barriers: Vec::new(), validator: Some(validator) }
    }

    pub fn no_pending_barriers(&self) -> bool {
        self.barriers.is_empty()
    }

    pub fn pending(&self) -> &[Barrier] {
        &self.barriers
    }

    /// Flush all pending barriers as one sink call. No-op when empty. A dead
    /// handle fails validation and leaves the set untouched.
    pub fn commit_barriers<S: BarrierSink + ?Sized>(&mut self, sink: &mut S) -> Result<(), GfxError> {
        flush(&mut self.barriers, self.validator.as_deref(), sink)
    }

    /// Move a deferred set's barriers in front of ours and leave it empty.
    pub fn merge(&mut self, other: &mut DeferredBarrierSet) {
        prepend(&mut self.barriers, &mut other.barriers);
    }

    pub fn clear(&mut self) {
        self.barriers.clear();
    }

    /// Start a scoped batch. The batch must end with [`BarrierBatch::commit`].
    pub fn accumulate(&mut self) -> BarrierBatch<'_> {
        BarrierBatch { manager: self, committed: false }
    }
}

impl BarrierRecorder for BarrierManager {
    fn push_barrier(&mut self, barrier: Barrier) {
        self.barriers.push(barrier);
    }
}

/// Scoped barrier builder. Its only terminal is `commit`; dropping it
/// uncommitted is a contract violation.
#[must_use = "a BarrierBatch must be finished with commit()"]
pub struct BarrierBatch<'a> {
    manager: &'a mut BarrierManager,
    committed: bool,
}

impl BarrierBatch<'_> {
    pub fn commit<S: BarrierSink + ?Sized>(mut self, sink: &mut S) -> Result<(), GfxError> {
        self.committed = true;
        self.manager.commit_barriers(sink)
    }
}

impl BarrierRecorder for BarrierBatch<'_> {
    fn push_barrier(&mut self, barrier: Barrier) {
        self.manager.barriers.push(barrier);
    }
}

impl Drop for BarrierBatch<'_> {
    fn drop(&mut self) {
        if self.committed || std::thread::panicking() {
            return;
        }
        warn!(pending = self.manager.barriers.len(), "barrier batch dropped without commit");
        debug_assert!(false, "barrier batch dropped without commit");
    }
}
