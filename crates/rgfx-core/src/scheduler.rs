//! Frame and command batch scheduling.
//!
//! A `RenderTaskScheduler` owns a fixed pool of batches. Frames move
//! Idle → RecordFrame → Idle; at most `max_frames` ended frames may be in
//! flight, and `wait_next_frame` retires them one per call, oldest first.
//!
//! Lock order: frame state, then a queue, then a batch slot. The free list is
//! a leaf.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use rgfx_protocol::{FrameId, QueueType};

use crate::batch::{BatchId, BatchState, CmdBatchDesc, CommandBatch, SubmitMode};
use crate::config::GraphicsConfig;
use crate::error::GfxError;
use crate::handle::Handle;
use crate::registry::HandleRegistry;
use crate::sync::{SemaphoreDep, SubmitBackend, Submission, TimelineSync};

/// Observer of frame boundaries, e.g. registries and staging heaps.
pub trait FrameListener: Send + Sync {
    fn on_begin_frame(&self, _frame: FrameId) {}
    fn on_frame_retired(&self, _frame: FrameId) {}
}

impl<T: Send + Sync> FrameListener for HandleRegistry<T> {
    fn on_begin_frame(&self, frame: FrameId) {
        self.set_current_frame(frame);
    }

    fn on_frame_retired(&self, frame: FrameId) {
        drop(self.retire(frame));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_frames: u32,
    pub max_pending_batches: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&GraphicsConfig::default())
    }
}

impl From<&GraphicsConfig> for SchedulerConfig {
    fn from(config: &GraphicsConfig) -> Self {
        Self {
            max_frames: config.max_frames,
            max_pending_batches: config.max_pending_batches,
        }
    }
}

/// Last signal per queue for one ended frame. Waiting on all of them waits
/// for the whole frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCompletion {
    pub frame: FrameId,
    pub queues: [Option<SemaphoreDep>; QueueType::COUNT],
}

impl FrameCompletion {
    pub fn deps(&self) -> Vec<SemaphoreDep> {
        self.queues.iter().flatten().copied().collect()
    }

    pub fn queue(&self, queue: QueueType) -> Option<SemaphoreDep> {
        self.queues[queue.index()]
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(Option::is_none)
    }
}

struct FrameState {
    current: FrameId,
    recording: bool,
    /// Unique id of the newest retired frame.
    retired: u64,
    in_flight: VecDeque<FrameCompletion>,
}

struct PendingSubmit {
    index: u32,
    frame: FrameId,
    cmd_buffers: Vec<Handle>,
    waits: Vec<SemaphoreDep>,
    signals: Vec<SemaphoreDep>,
}

struct QueueState {
    deferred: Vec<PendingSubmit>,
    /// Submitted batch slots, per frame slot.
    submitted: Vec<Vec<u32>>,
    last_signal: Vec<Option<SemaphoreDep>>,
    opened_this_frame: u32,
}

impl QueueState {
    fn new(max_frames: usize) -> Self {
        Self {
            deferred: Vec::new(),
            submitted: vec![Vec::new(); max_frames],
            last_signal: vec![None; max_frames],
            opened_this_frame: 0,
        }
    }
}

pub struct RenderTaskScheduler {
    sync: TimelineSync,
    config: SchedulerConfig,
    frame: Mutex<FrameState>,
    queues: [Mutex<QueueState>; QueueType::COUNT],
    batches: Box<[Mutex<CommandBatch>]>,
    free: Mutex<Vec<u32>>,
    listeners: RwLock<Vec<Arc<dyn FrameListener>>>,
}

impl RenderTaskScheduler {
    pub fn new(backend: Arc<dyn SubmitBackend>, config: SchedulerConfig) -> Self {
        let max_frames = config.max_frames.clamp(1, FrameId::MAX_FRAMES_LIMIT);
        let config = SchedulerConfig {
            max_frames,
            max_pending_batches: config.max_pending_batches.max(1),
        };
        let initial = FrameId::initial(max_frames);
        let pool = (max_frames * config.max_pending_batches) as usize * QueueType::COUNT;

        debug!(
            max_frames,
            max_pending_batches = config.max_pending_batches,
            pool,
            timeline = backend.supports_timeline(),
            "scheduler created"
        );

        Self {
            sync: TimelineSync::new(backend),
            config,
            frame: Mutex::new(FrameState {
                current: initial,
                recording: false,
                retired: 0,
                in_flight: VecDeque::new(),
            }),
            queues: std::array::from_fn(|_| Mutex::new(QueueState::new(max_frames as usize))),
            batches: (0..pool).map(|_| Mutex::new(CommandBatch::new(initial))).collect(),
            free: Mutex::new((0..pool as u32).rev().collect()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    pub fn add_listener(&self, listener: Arc<dyn FrameListener>) {
        self.listeners.write().push(listener);
    }

    /// Frame currently (or most recently) recorded.
    pub fn current_frame(&self) -> FrameId {
        self.frame.lock().current
    }

    pub fn is_recording(&self) -> bool {
        self.frame.lock().recording
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frame.lock().in_flight.len()
    }

    pub fn completed_value(&self, semaphore: Handle) -> u64 {
        self.sync.completed_value(semaphore)
    }

    // ── Frames ──────────────────────────────────────────────────────────

    /// Start recording the next frame. Fails if the frame that last used the
    /// same pool slot has not been retired.
    pub fn begin_frame(&self) -> Result<FrameId, GfxError> {
        let frame = {
            let mut state = self.frame.lock();
            if state.recording {
                return Err(GfxError::validation(format!(
                    "begin_frame while {} is still recording",
                    state.current
                )));
            }
            let frame = state.current.next();
            if let Some(prev) = frame.prev_cycle() {
                if prev.unique() > state.retired {
                    return Err(GfxError::validation(format!(
                        "{} is still in flight; wait_next_frame must retire it first",
                        prev
                    )));
                }
            }
            state.current = frame;
            state.recording = true;
            for queue in &self.queues {
                queue.lock().opened_this_frame = 0;
            }
            frame
        };

        for listener in self.listeners.read().iter() {
            listener.on_begin_frame(frame);
        }
        debug!(%frame, "frame begun");
        Ok(frame)
    }

    /// Flush deferred batches, cancel batches still recording and close the
    /// frame.
    pub fn end_frame(&self) -> Result<FrameCompletion, GfxError> {
        let mut state = self.frame.lock();
        if !state.recording {
            return Err(GfxError::validation("end_frame without begin_frame"));
        }
        let frame = state.current;

        for queue in QueueType::ALL {
            let mut qs = self.queues[queue.index()].lock();
            if let Err(e) = self.flush_locked(queue, &mut qs) {
                error!(%frame, ?queue, error = %e, "deferred submission failed at end of frame");
            }
        }

        for (index, slot) in self.batches.iter().enumerate() {
            let mut batch = slot.lock();
            if batch.state == BatchState::Recording && batch.frame == frame {
                warn!(
                    batch = %batch.id(index as u32),
                    label = %batch.label,
                    %frame,
                    "cancelling batch still recording at end of frame"
                );
                batch.state = BatchState::Cancelled;
                batch.recycle();
                self.free.lock().push(index as u32);
            }
        }

        let mut completion = FrameCompletion { frame, queues: [None; QueueType::COUNT] };
        for queue in QueueType::ALL {
            completion.queues[queue.index()] =
                self.queues[queue.index()].lock().last_signal[frame.index()];
        }

        state.in_flight.push_back(completion);
        state.recording = false;
        debug!(%frame, in_flight = state.in_flight.len(), "frame ended");
        Ok(completion)
    }

    /// Block until the frame `next − max_frames` completes, then retire it.
    /// Retires at most one frame per call; returns it, or `None` when no
    /// frame needed retiring. On timeout nothing changes.
    pub fn wait_next_frame(&self, timeout: Duration) -> Result<Option<FrameId>, GfxError> {
        let completion = {
            let state = self.frame.lock();
            let next = state.current.unique() + 1;
            let Some(target) = next.checked_sub(u64::from(self.config.max_frames)) else {
                return Ok(None);
            };
            if target <= state.retired {
                return Ok(None);
            }
            match state.in_flight.front() {
                Some(front) if front.frame.unique() <= target => *front,
                _ if state.recording && state.current.unique() == target => {
                    return Err(GfxError::validation(format!(
                        "{} must end before it can be waited on",
                        state.current
                    )));
                }
                _ => return Ok(None),
            }
        };

        if !self.sync.wait(&completion.deps(), timeout) {
            return Err(GfxError::Timeout(timeout));
        }

        let frame = completion.frame;
        {
            let mut state = self.frame.lock();
            if state.in_flight.front().map(|c| c.frame) != Some(frame) {
                // Retired concurrently.
                return Ok(None);
            }
            state.in_flight.pop_front();
            state.retired = frame.unique();
            self.recycle_frame(frame);
        }

        for listener in self.listeners.read().iter() {
            listener.on_frame_retired(frame);
        }
        debug!(%frame, "frame retired");
        Ok(Some(frame))
    }

    fn recycle_frame(&self, frame: FrameId) {
        for queue in &self.queues {
            let mut qs = queue.lock();
            let submitted = std::mem::take(&mut qs.submitted[frame.index()]);
            qs.last_signal[frame.index()] = None;
            for index in submitted {
                let mut batch = self.batches[index as usize].lock();
                if batch.frame != frame {
                    continue;
                }
                batch.state = BatchState::Completed;
                if let Some(fence) = batch.recycle() {
                    self.sync.retire_fence(fence);
                }
                self.free.lock().push(index);
            }
        }
    }

    /// Flush every queue and block until all submitted work completes.
    pub fn wait_all(&self, timeout: Duration) -> Result<(), GfxError> {
        let mut deps = Vec::new();
        for queue in QueueType::ALL {
            let mut qs = self.queues[queue.index()].lock();
            self.flush_locked(queue, &mut qs)?;
            deps.extend(qs.last_signal.iter().flatten().copied());
        }
        if self.sync.wait(&deps, timeout) {
            Ok(())
        } else {
            Err(GfxError::Timeout(timeout))
        }
    }

    // ── Batches ─────────────────────────────────────────────────────────

    pub fn begin_cmd_batch(&self, desc: CmdBatchDesc) -> Result<BatchId, GfxError> {
        let state = self.frame.lock();
        if !state.recording {
            return Err(GfxError::validation("begin_cmd_batch outside a frame"));
        }
        let frame = state.current;

        let mut qs = self.queues[desc.queue.index()].lock();
        if qs.opened_this_frame >= self.config.max_pending_batches {
            return Err(GfxError::ResourceExhausted(format!(
                "{:?} queue already has {} batches in {}",
                desc.queue, self.config.max_pending_batches, frame
            )));
        }
        let index = self
            .free
            .lock()
            .pop()
            .ok_or_else(|| GfxError::ResourceExhausted("batch pool empty".into()))?;

        let mut batch = self.batches[index as usize].lock();
        let semaphore = match batch.semaphore {
            Some(semaphore) => semaphore,
            None => match self.sync.backend().create_semaphore() {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    self.free.lock().push(index);
                    return Err(e);
                }
            },
        };
        let queue = desc.queue;
        batch.open(desc, frame, semaphore);
        qs.opened_this_frame += 1;

        let id = batch.id(index);
        trace!(batch = %id, ?queue, %frame, label = %batch.label, "batch opened");
        Ok(id)
    }

    fn with_batch<R>(
        &self,
        id: BatchId,
        f: impl FnOnce(&mut CommandBatch) -> Result<R, GfxError>,
    ) -> Result<R, GfxError> {
        let slot = self
            .batches
            .get(id.index() as usize)
            .ok_or_else(|| GfxError::validation(format!("{} out of range", id)))?;
        let mut batch = slot.lock();
        if !batch.matches(id) {
            return Err(GfxError::validation(format!("{} is stale", id)));
        }
        f(&mut batch)
    }

    fn with_recording<R>(
        &self,
        id: BatchId,
        f: impl FnOnce(&mut CommandBatch) -> Result<R, GfxError>,
    ) -> Result<R, GfxError> {
        self.with_batch(id, |batch| {
            if batch.state != BatchState::Recording {
                return Err(GfxError::validation(format!(
                    "{} is {:?}, not recording",
                    id, batch.state
                )));
            }
            f(batch)
        })
    }

    /// Reserve the next execution slot. Slots submit in reservation order
    /// regardless of commit order.
    pub fn reserve_cmd_buffer(&self, id: BatchId) -> Result<u32, GfxError> {
        self.with_recording(id, |batch| {
            batch.cmd_buffers.push(None);
            Ok((batch.cmd_buffers.len() - 1) as u32)
        })
    }

    pub fn commit_cmd_buffer(&self, id: BatchId, exe_index: u32, cmdbuf: Handle) -> Result<(), GfxError> {
        self.commit_slot(id, exe_index, cmdbuf, false)
    }

    /// Commit at a caller-chosen index, reserving every slot up to it first.
    /// Remote recorders number their command buffers themselves and bake
    /// them in any order.
    pub fn commit_cmd_buffer_at(&self, id: BatchId, exe_index: u32, cmdbuf: Handle) -> Result<(), GfxError> {
        self.commit_slot(id, exe_index, cmdbuf, true)
    }

    /// Queue and frame of a batch that is still recording.
    pub fn recording_batch(&self, id: BatchId) -> Result<(QueueType, FrameId), GfxError> {
        self.with_recording(id, |batch| Ok((batch.queue, batch.frame)))
    }

    fn commit_slot(&self, id: BatchId, exe_index: u32, cmdbuf: Handle, reserve: bool) -> Result<(), GfxError> {
        if !cmdbuf.is_valid() {
            return Err(GfxError::validation("commit of an invalid command buffer"));
        }
        self.with_recording(id, |batch| {
            let needed = exe_index as usize + 1;
            if reserve && batch.cmd_buffers.len() < needed {
                batch.cmd_buffers.resize(needed, None);
            }
            match batch.cmd_buffers.get_mut(exe_index as usize) {
                Some(entry) if entry.is_none() => {
                    *entry = Some(cmdbuf);
                    Ok(())
                }
                Some(_) => Err(GfxError::validation(format!(
                    "{} execution index {} already committed",
                    id, exe_index
                ))),
                None => Err(GfxError::validation(format!(
                    "{} execution index {} was never reserved",
                    id, exe_index
                ))),
            }
        })
    }

    pub fn add_input_dependency(&self, id: BatchId, dep: SemaphoreDep) -> Result<(), GfxError> {
        self.with_recording(id, |batch| {
            batch.waits.push(dep);
            Ok(())
        })
    }

    pub fn add_output_dependency(&self, id: BatchId, dep: SemaphoreDep) -> Result<(), GfxError> {
        self.with_recording(id, |batch| {
            batch.extra_signals.push(dep);
            Ok(())
        })
    }

    /// Point another batch (or the host) can wait on for this batch.
    pub fn batch_semaphore(&self, id: BatchId) -> Result<SemaphoreDep, GfxError> {
        self.with_batch(id, |batch| {
            batch
                .completion()
                .ok_or_else(|| GfxError::validation(format!("{} has no semaphore", id)))
        })
    }

    /// Close recording and queue the batch. Fails without side effects if a
    /// reserved command buffer was never committed.
    pub fn end_recording_and_submit(&self, id: BatchId, mode: SubmitMode) -> Result<(), GfxError> {
        let queue = self.with_recording(id, |batch| Ok(batch.queue))?;
        let mut qs = self.queues[queue.index()].lock();

        let pending = self.with_recording(id, |batch| {
            let missing = batch.uncommitted();
            if missing > 0 {
                return Err(GfxError::validation(format!(
                    "{} has {} reserved command buffer(s) not committed",
                    id, missing
                )));
            }
            let completion = batch
                .completion()
                .ok_or_else(|| GfxError::validation(format!("{} has no semaphore", id)))?;
            let mut signals = vec![completion];
            signals.extend(batch.extra_signals.iter().copied());
            batch.state = BatchState::Submitted;
            Ok(PendingSubmit {
                index: id.index(),
                frame: batch.frame,
                cmd_buffers: batch.cmd_buffers.iter().flatten().copied().collect(),
                waits: batch.waits.clone(),
                signals,
            })
        })?;

        qs.deferred.push(pending);
        match mode {
            SubmitMode::Immediately => self.flush_locked(queue, &mut qs),
            SubmitMode::Deferred => Ok(()),
        }
    }

    /// Submit every deferred batch on `queue`, in order.
    pub fn flush(&self, queue: QueueType) -> Result<(), GfxError> {
        let mut qs = self.queues[queue.index()].lock();
        self.flush_locked(queue, &mut qs)
    }

    fn flush_locked(&self, queue: QueueType, qs: &mut QueueState) -> Result<(), GfxError> {
        let mut first_err = None;
        for pending in std::mem::take(&mut qs.deferred) {
            if let Err(e) = self.submit_pending(queue, qs, pending) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn submit_pending(
        &self,
        queue: QueueType,
        qs: &mut QueueState,
        pending: PendingSubmit,
    ) -> Result<(), GfxError> {
        let result = self.sync.prepare_fence().and_then(|fence| {
            let submission = Submission {
                queue,
                command_buffers: &pending.cmd_buffers,
                waits: &pending.waits,
                signals: &pending.signals,
                fence,
            };
            match self.sync.backend().submit(&submission) {
                Ok(()) => Ok(fence),
                Err(e) => {
                    if let Some(fence) = fence {
                        self.sync.retire_fence(fence);
                    }
                    Err(e)
                }
            }
        });

        let mut batch = self.batches[pending.index as usize].lock();
        match result {
            Ok(fence) => {
                self.sync.on_submitted(&pending.signals, fence);
                batch.fence = fence;
                let slot = pending.frame.index();
                qs.submitted[slot].push(pending.index);
                qs.last_signal[slot] = pending.signals.first().copied();
                trace!(
                    batch = %batch.id(pending.index),
                    ?queue,
                    cmd_buffers = pending.cmd_buffers.len(),
                    "batch submitted"
                );
                Ok(())
            }
            Err(e) => {
                error!(batch = %batch.id(pending.index), ?queue, error = %e, "submission failed");
                batch.state = BatchState::Cancelled;
                batch.recycle();
                self.free.lock().push(pending.index);
                Err(e)
            }
        }
    }

    /// Cancel a batch that is still recording. Its slot is reused.
    pub fn skip_cmd_batch(&self, id: BatchId) -> Result<(), GfxError> {
        self.with_recording(id, |batch| {
            batch.state = BatchState::Cancelled;
            batch.recycle();
            Ok(())
        })?;
        self.free.lock().push(id.index());
        trace!(batch = %id, "batch skipped");
        Ok(())
    }

    /// `None` once the slot has been recycled for another batch.
    pub fn batch_state(&self, id: BatchId) -> Option<BatchState> {
        let slot = self.batches.get(id.index() as usize)?;
        let mut batch = slot.lock();
        if !batch.matches(id) {
            return None;
        }
        if batch.state == BatchState::Submitted {
            if let Some(dep) = batch.completion() {
                if self.sync.is_reached(dep) {
                    batch.state = BatchState::Completed;
                }
            }
        }
        Some(batch.state)
    }

    /// True once the batch has finished executing. Recycled batches count as
    /// completed.
    pub fn is_batch_completed(&self, id: BatchId) -> bool {
        match self.batch_state(id) {
            Some(state) => state == BatchState::Completed,
            None => true,
        }
    }

    /// Wait for one batch. False on timeout or when the batch can never
    /// complete (still recording, or cancelled).
    pub fn wait_batch(&self, id: BatchId, timeout: Duration) -> bool {
        let (state, queue, dep) = {
            let Some(slot) = self.batches.get(id.index() as usize) else {
                return false;
            };
            let batch = slot.lock();
            if !batch.matches(id) {
                return true;
            }
            (batch.state, batch.queue, batch.completion())
        };

        match state {
            BatchState::Completed => true,
            BatchState::Recording | BatchState::Cancelled => {
                debug!(batch = %id, ?state, "wait on a batch that was never submitted");
                false
            }
            BatchState::Submitted => {
                {
                    let mut qs = self.queues[queue.index()].lock();
                    if qs.deferred.iter().any(|p| p.index == id.index()) {
                        if let Err(e) = self.flush_locked(queue, &mut qs) {
                            error!(batch = %id, error = %e, "flush before wait failed");
                            return false;
                        }
                    }
                }
                match dep {
                    Some(dep) => self.sync.wait(&[dep], timeout),
                    None => false,
                }
            }
        }
    }
}

impl Drop for RenderTaskScheduler {
    fn drop(&mut self) {
        for slot in self.batches.iter() {
            let batch = slot.lock();
            if let Some(semaphore) = batch.semaphore {
                self.sync.backend().destroy_semaphore(semaphore);
            }
        }
    }
}
