use rgfx_protocol::{FrameId, QueueType};

use crate::handle::Handle;
use crate::sync::SemaphoreDep;

/// Index into the scheduler's batch pool plus the generation of the
/// occupant it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId {
    index: u32,
    generation: u32,
}

impl BatchId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn invalid() -> Self {
        Self { index: u32::MAX, generation: 0 }
    }

    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Packed form used on the wire.
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self { index: bits as u32, generation: (bits >> 32) as u32 }
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    Recording,
    Submitted,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Flush the queue now, including earlier deferred batches.
    Immediately,
    /// Hold until the queue is next flushed or the frame ends.
    Deferred,
}

/// Parameters for opening a batch.
#[derive(Debug, Clone)]
pub struct CmdBatchDesc {
    pub queue: QueueType,
    pub label: String,
    pub wait_for: Vec<SemaphoreDep>,
}

impl CmdBatchDesc {
    pub fn new(queue: QueueType) -> Self {
        Self { queue, label: String::new(), wait_for: Vec::new() }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn wait_on(mut self, dep: SemaphoreDep) -> Self {
        self.wait_for.push(dep);
        self
    }
}

/// Pool slot. Survives across generations so its semaphore can be reused.
pub(crate) struct CommandBatch {
    pub generation: u32,
    pub state: BatchState,
    pub queue: QueueType,
    pub frame: FrameId,
    pub label: String,
    /// Indexed by execution index; `None` until committed.
    pub cmd_buffers: Vec<Option<Handle>>,
    pub waits: Vec<SemaphoreDep>,
    pub extra_signals: Vec<SemaphoreDep>,
    pub semaphore: Option<Handle>,
    /// Number of times this slot has been opened; also its signal value.
    pub uses: u64,
    pub fence: Option<Handle>,
}

impl CommandBatch {
    pub fn new(frame: FrameId) -> Self {
        Self {
            generation: 1,
            state: BatchState::Cancelled,
            queue: QueueType::Graphics,
            frame,
            label: String::new(),
            cmd_buffers: Vec::new(),
            waits: Vec::new(),
            extra_signals: Vec::new(),
            semaphore: None,
            uses: 0,
            fence: None,
        }
    }

    pub fn id(&self, index: u32) -> BatchId {
        BatchId::new(index, self.generation)
    }

    pub fn matches(&self, id: BatchId) -> bool {
        self.generation == id.generation()
    }

    pub fn completion(&self) -> Option<SemaphoreDep> {
        self.semaphore.map(|s| SemaphoreDep::new(s, self.uses))
    }

    pub fn open(&mut self, desc: CmdBatchDesc, frame: FrameId, semaphore: Handle) {
        self.state = BatchState::Recording;
        self.queue = desc.queue;
        self.frame = frame;
        self.label = desc.label;
        self.cmd_buffers.clear();
        self.waits = desc.wait_for;
        self.extra_signals.clear();
        self.semaphore = Some(semaphore);
        self.uses += 1;
        self.fence = None;
    }

    /// Invalidate outstanding ids and return the slot to the free pool.
    pub fn recycle(&mut self) -> Option<Handle> {
        self.generation = self.generation.wrapping_add(1).max(1);
        self.cmd_buffers.clear();
        self.waits.clear();
        self.extra_signals.clear();
        self.label.clear();
        self.fence.take()
    }

    pub fn uncommitted(&self) -> usize {
        self.cmd_buffers.iter().filter(|c| c.is_none()).count()
    }
}
