//! Submission and semaphore primitives.
//!
//! Every batch signals a `SemaphoreDep`. Backends with timeline semaphores
//! answer completion queries directly; the rest get an [`EmulatedTimeline`]
//! that pairs each signalled value with a binary fence.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use rgfx_protocol::QueueType;

use crate::error::GfxError;
use crate::handle::Handle;

/// Longest wait a deadline is built for. Longer timeouts, up to the
/// `u64::MAX` milliseconds a client may send, wait this long instead.
pub const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Deadline `timeout` from now, clamped to [`MAX_WAIT`] so it cannot
/// overflow `Instant`.
pub fn deadline(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(MAX_WAIT)
}

/// A semaphore together with the value that marks the awaited point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreDep {
    pub semaphore: Handle,
    pub value: u64,
}

impl SemaphoreDep {
    pub fn new(semaphore: Handle, value: u64) -> Self {
        Self { semaphore, value }
    }
}

/// One queue submission handed to the backend.
#[derive(Debug)]
pub struct Submission<'a> {
    pub queue: QueueType,
    /// Command buffers in execution order.
    pub command_buffers: &'a [Handle],
    pub waits: &'a [SemaphoreDep],
    pub signals: &'a [SemaphoreDep],
    /// Binary fence signalled on completion, only on non-timeline backends.
    pub fence: Option<Handle>,
}

/// Native queue submission and semaphore access.
pub trait SubmitBackend: Send + Sync {
    fn supports_timeline(&self) -> bool {
        true
    }

    fn create_semaphore(&self) -> Result<Handle, GfxError>;

    fn destroy_semaphore(&self, _semaphore: Handle) {}

    fn submit(&self, submission: &Submission<'_>) -> Result<(), GfxError>;

    /// Highest value the semaphore has reached.
    fn signaled_value(&self, semaphore: Handle) -> u64;

    /// Block until every dependency is reached. False on timeout.
    fn wait(&self, deps: &[SemaphoreDep], timeout: Duration) -> bool;

    fn create_fence(&self) -> Result<Handle, GfxError> {
        Err(GfxError::Backend("binary fences not supported".into()))
    }

    fn destroy_fence(&self, _fence: Handle) {}

    fn is_fence_signaled(&self, _fence: Handle) -> bool {
        false
    }

    fn wait_fence(&self, _fence: Handle, _timeout: Duration) -> bool {
        false
    }
}

/// Binary fence standing in for one timeline value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualFence {
    pub value: u64,
    pub fence: Handle,
}

#[derive(Default)]
struct EmulatedSemaphore {
    completed: u64,
    pending: VecDeque<VirtualFence>,
}

/// Per-semaphore ordered list of virtual fences.
#[derive(Default)]
pub struct EmulatedTimeline {
    semaphores: Mutex<HashMap<Handle, EmulatedSemaphore>>,
}

impl EmulatedTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, semaphore: Handle, value: u64, fence: Handle) {
        let mut semaphores = self.semaphores.lock();
        let entry = semaphores.entry(semaphore).or_default();
        entry.pending.push_back(VirtualFence { value, fence });
    }

    /// Highest completed value, polling fences front to back.
    pub fn completed_value(&self, backend: &dyn SubmitBackend, semaphore: Handle) -> u64 {
        let mut semaphores = self.semaphores.lock();
        let Some(entry) = semaphores.get_mut(&semaphore) else {
            return 0;
        };
        Self::poll(backend, entry);
        entry.completed
    }

    fn poll(backend: &dyn SubmitBackend, entry: &mut EmulatedSemaphore) {
        while let Some(front) = entry.pending.front().copied() {
            if !backend.is_fence_signaled(front.fence) {
                break;
            }
            entry.completed = entry.completed.max(front.value);
            entry.pending.pop_front();
        }
    }

    pub fn wait(&self, backend: &dyn SubmitBackend, deps: &[SemaphoreDep], timeout: Duration) -> bool {
        let deadline = deadline(timeout);
        for dep in deps {
            if self.completed_value(backend, dep.semaphore) >= dep.value {
                continue;
            }
            let fence = {
                let semaphores = self.semaphores.lock();
                semaphores
                    .get(&dep.semaphore)
                    .and_then(|e| e.pending.iter().find(|f| f.value >= dep.value).copied())
            };
            // Nothing submitted signals this value yet.
            let Some(fence) = fence else {
                return false;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !backend.wait_fence(fence.fence, remaining) {
                return false;
            }
        }
        true
    }

    /// Drop every reference to `fence`, counting it as signalled.
    pub fn remove_fence(&self, fence: Handle) {
        for entry in self.semaphores.lock().values_mut() {
            while let Some(pos) = entry.pending.iter().position(|f| f.fence == fence) {
                if let Some(done) = entry.pending.remove(pos) {
                    entry.completed = entry.completed.max(done.value);
                }
            }
        }
    }

    pub fn forget(&self, semaphore: Handle) {
        self.semaphores.lock().remove(&semaphore);
    }
}

/// Completion queries over either native timelines or the emulation.
pub struct TimelineSync {
    backend: Arc<dyn SubmitBackend>,
    emulated: Option<EmulatedTimeline>,
}

impl TimelineSync {
    pub fn new(backend: Arc<dyn SubmitBackend>) -> Self {
        let emulated = (!backend.supports_timeline()).then(EmulatedTimeline::new);
        Self { backend, emulated }
    }

    pub fn backend(&self) -> &Arc<dyn SubmitBackend> {
        &self.backend
    }

    pub fn is_emulated(&self) -> bool {
        self.emulated.is_some()
    }

    /// Fence to attach to the next submission, if emulating.
    pub fn prepare_fence(&self) -> Result<Option<Handle>, GfxError> {
        match self.emulated {
            Some(_) => self.backend.create_fence().map(Some),
            None => Ok(None),
        }
    }

    pub fn on_submitted(&self, signals: &[SemaphoreDep], fence: Option<Handle>) {
        if let (Some(emulated), Some(fence)) = (&self.emulated, fence) {
            for signal in signals {
                emulated.push(signal.semaphore, signal.value, fence);
            }
        }
        trace!(signals = signals.len(), "submission recorded");
    }

    /// Release a fence once the submission it guarded has been recycled.
    pub fn retire_fence(&self, fence: Handle) {
        if let Some(emulated) = &self.emulated {
            emulated.remove_fence(fence);
        }
        self.backend.destroy_fence(fence);
    }

    pub fn completed_value(&self, semaphore: Handle) -> u64 {
        match &self.emulated {
            Some(emulated) => emulated.completed_value(self.backend.as_ref(), semaphore),
            None => self.backend.signaled_value(semaphore),
        }
    }

    pub fn is_reached(&self, dep: SemaphoreDep) -> bool {
        self.completed_value(dep.semaphore) >= dep.value
    }

    pub fn wait(&self, deps: &[SemaphoreDep], timeout: Duration) -> bool {
        if deps.iter().all(|d| self.is_reached(*d)) {
            return true;
        }
        match &self.emulated {
            Some(emulated) => emulated.wait(self.backend.as_ref(), deps, timeout),
            None => self.backend.wait(deps, timeout),
        }
    }
}
